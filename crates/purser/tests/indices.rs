//! Cross-module tests of the derivative indices over a realistic cruise
//! tree: incremental MD5 merges stay sorted and unique, a rebuild
//! round-trips, and the dashboard manifest never dangles.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use purser::dashboard::{Manifest, ManifestEntry};
use purser::md5::{self, Md5Summary};

fn write_cruise_tree(base: &Path) {
    fs::create_dir_all(base.join("FK250801/SCS")).unwrap();
    fs::create_dir_all(base.join("FK250801/EM124")).unwrap();
    fs::create_dir_all(base.join("FK250801/Dashboard_Data")).unwrap();
    fs::write(base.join("FK250801/SCS/pos_001.raw"), b"lat,lon\n1,2\n").unwrap();
    fs::write(base.join("FK250801/SCS/pos_002.raw"), b"lat,lon\n3,4\n").unwrap();
    fs::write(base.join("FK250801/EM124/swath_001.all"), vec![0u8; 512]).unwrap();
}

#[test]
fn md5_update_merge_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let summary_path = tmp.path().join("MD5_Summary.txt");

    fs::write(
        &summary_path,
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa dir/a.txt\n\
         bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb dir/b.txt\n",
    )
    .unwrap();

    let mut summary = Md5Summary::load(&summary_path).unwrap();
    summary.merge(vec![
        md5::HashEntry {
            hash: "c".repeat(32),
            filename: "dir/a.txt".into(),
        },
        md5::HashEntry {
            hash: "d".repeat(32),
            filename: "dir/c.txt".into(),
        },
    ]);
    summary.remove(&["dir/b.txt".to_string()]);
    summary.write(&summary_path).unwrap();

    let content = fs::read_to_string(&summary_path).unwrap();
    assert_eq!(
        content,
        format!("{} dir/a.txt\n{} dir/c.txt\n", "c".repeat(32), "d".repeat(32))
    );
}

#[test]
fn md5_rebuild_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    write_cruise_tree(tmp.path());
    let cruise_dir = tmp.path().join("FK250801");

    let filelist = vec![
        "EM124/swath_001.all".to_string(),
        "SCS/pos_001.raw".to_string(),
        "SCS/pos_002.raw".to_string(),
    ];
    let cancel = AtomicBool::new(false);
    let hashes = md5::build_hashes(&cruise_dir, &filelist, None, &cancel, |_, _| {});

    let summary_path = cruise_dir.join("MD5_Summary.txt");
    let md5_path = cruise_dir.join("MD5_Summary.md5");
    let mut summary = Md5Summary::new();
    summary.merge(hashes);
    summary.write(&summary_path).unwrap();
    md5::write_summary_md5(&summary_path, &md5_path).unwrap();

    // Reload and recompute: every recorded hash matches the file contents.
    let reloaded = Md5Summary::load(&summary_path).unwrap();
    assert_eq!(reloaded.entries().len(), 3);
    for entry in reloaded.entries() {
        let recomputed = md5::hash_file(&cruise_dir.join(&entry.filename)).unwrap();
        assert_eq!(entry.hash, recomputed, "hash drift for {}", entry.filename);
    }

    // Rows are sorted by filename and unique.
    let names: Vec<&str> = reloaded.entries().iter().map(|e| e.filename.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(names, sorted);

    // The companion file holds the MD5 of the summary itself.
    assert_eq!(
        fs::read_to_string(&md5_path).unwrap(),
        md5::hash_file(&summary_path).unwrap()
    );
}

#[test]
fn manifest_never_dangles_after_removal() {
    let tmp = tempfile::tempdir().unwrap();
    write_cruise_tree(tmp.path());
    let manifest_path = tmp.path().join("FK250801/Dashboard_Data/manifest.json");

    let dd_json_rel = "FK250801/Dashboard_Data/SCS/pos_001.json";
    let dd_json_abs = tmp.path().join(dd_json_rel);
    fs::create_dir_all(dd_json_abs.parent().unwrap()).unwrap();
    fs::write(&dd_json_abs, b"{\"type\":\"gga\"}").unwrap();

    let mut manifest = Manifest::new();
    manifest.upsert(ManifestEntry {
        data_type: Some("gga".into()),
        dd_json: dd_json_rel.into(),
        raw_data: "FK250801/SCS/pos_001.raw".into(),
    });
    manifest.upsert(ManifestEntry {
        data_type: Some("geotiff".into()),
        dd_json: "FK250801/Dashboard_Data/EM124/swath_001.json".into(),
        raw_data: "FK250801/EM124/swath_001.all".into(),
    });
    manifest.write(&manifest_path).unwrap();

    // Remove the SCS entry; its dd_json file must go with it.
    let mut manifest = Manifest::load(&manifest_path).unwrap();
    let removed = manifest.remove(
        &[ManifestEntry {
            data_type: None,
            dd_json: dd_json_rel.into(),
            raw_data: "FK250801/SCS/pos_001.raw".into(),
        }],
        tmp.path(),
    );
    manifest.write(&manifest_path).unwrap();

    assert_eq!(removed, 1);
    assert!(!dd_json_abs.exists());

    // Every surviving entry's raw_data still exists under the base.
    let reloaded = Manifest::load(&manifest_path).unwrap();
    for entry in reloaded.entries() {
        assert!(
            tmp.path().join(&entry.raw_data).is_file(),
            "dangling manifest entry: {}",
            entry.raw_data
        );
    }
}
