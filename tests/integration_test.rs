mod common;

use common::{copy_tree, fingerprint, write_tree};
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn treedelta(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_treedelta"))
        .args(args)
        .output()
        .expect("Failed to run treedelta")
}

fn path(p: &Path) -> &str {
    p.to_str().unwrap()
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create(old: &Path, new: &Path, patch: &Path, compression: &str) {
    let output = treedelta(&[
        "create",
        "--old",
        path(old),
        "--new",
        path(new),
        "--output",
        path(patch),
        "--compression",
        compression,
    ]);
    assert_success(&output, "treedelta create");
}

#[test]
fn test_end_to_end_full_patch_cycle() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let target_dir = temp.path().join("target");
    let patch_file = temp.path().join("test.patch");

    write_tree(
        &old_dir,
        &[
            ("readme.txt", b"Hello, World! This is version 1."),
            ("config/settings.json", b"{\"version\": 1, \"debug\": false}"),
            ("data/records.bin", &vec![0xAA; 8192]),
            ("data/old_file.txt", b"This file will be deleted"),
            ("obsolete/remove_me.txt", b"Going away"),
        ],
    );

    let mut modified_bin = vec![0xAA; 4096];
    modified_bin.extend_from_slice(&[0xBB; 4096]);
    write_tree(
        &new_dir,
        &[
            ("readme.txt", b"Hello, World! This is version 2 with new features."),
            ("config/settings.json", b"{\"version\": 2, \"debug\": true, \"newField\": 42}"),
            ("data/records.bin", &modified_bin),
            ("data/new_file.txt", b"Brand new file in version 2"),
            ("extras/deep/bonus.dat", &vec![0xFF; 1024]),
        ],
    );
    copy_tree(&old_dir, &target_dir);

    create(&old_dir, &new_dir, &patch_file, "bzip2");
    assert!(fs::metadata(&patch_file).unwrap().len() > 38, "Patch must hold more than a header");

    let output = treedelta(&["apply", "--target", path(&target_dir), "--patch", path(&patch_file)]);
    assert_success(&output, "treedelta apply");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Files modified: 3"), "{stdout}");

    assert_eq!(fingerprint(&new_dir), fingerprint(&target_dir));
    assert!(!target_dir.join("obsolete").exists());
    assert!(!target_dir.join("data/old_file.txt").exists());
}

#[test]
fn test_inspect_json() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let patch_file = temp.path().join("test.patch");
    write_tree(&old_dir, &[("a.txt", b"old"), ("gone.txt", b"bye")]);
    write_tree(&new_dir, &[("a.txt", b"new"), ("sub/b.txt", b"b")]);

    create(&old_dir, &new_dir, &patch_file, "zstd");

    let output = treedelta(&["inspect", "--patch", path(&patch_file), "--json"]);
    assert_success(&output, "treedelta inspect");
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["version"], 1);
    assert_eq!(info["compression"], "zstd");
    assert_eq!(info["block_count"], 4);
    assert_eq!(info["checksum"].as_str().unwrap().len(), 32);

    // Payload blocks are written as their workers finish, so only the kinds are fixed.
    let blocks = info["blocks"].as_array().unwrap();
    let mut kinds: Vec<&str> = blocks.iter().map(|b| b["kind"].as_str().unwrap()).collect();
    kinds.sort_unstable();
    assert_eq!(kinds, vec!["CreateFile", "CreateFolder", "ModifyFile", "RemoveFile"]);

    let position = |path: &str| blocks.iter().position(|b| b["path"] == path).unwrap();
    assert!(position("sub") < position("sub/b.txt"));
}

#[test]
fn test_empty_to_full() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let target_dir = temp.path().join("target");
    let patch_file = temp.path().join("test.patch");

    fs::create_dir_all(&old_dir).unwrap();
    fs::create_dir_all(&target_dir).unwrap();
    write_tree(
        &new_dir,
        &[
            ("file1.txt", b"Content of file 1"),
            ("sub/file2.txt", b"Content of file 2"),
            ("sub/empty.txt", b""),
        ],
    );
    fs::create_dir_all(new_dir.join("sub/empty_dir")).unwrap();

    create(&old_dir, &new_dir, &patch_file, "gzip");
    let output = treedelta(&["apply", "--target", path(&target_dir), "--patch", path(&patch_file)]);
    assert_success(&output, "treedelta apply");

    assert_eq!(fingerprint(&new_dir), fingerprint(&target_dir));
}

#[test]
fn test_no_changes() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let target_dir = temp.path().join("target");
    let patch_file = temp.path().join("test.patch");

    let files: &[(&str, &[u8])] = &[("a.txt", b"Same content"), ("sub/b.txt", b"Also same")];
    write_tree(&old_dir, files);
    write_tree(&new_dir, files);
    copy_tree(&old_dir, &target_dir);

    create(&old_dir, &new_dir, &patch_file, "gzip");
    let output = treedelta(&["apply", "--target", path(&target_dir), "--patch", path(&patch_file)]);
    assert_success(&output, "treedelta apply");

    assert_eq!(fingerprint(&new_dir), fingerprint(&target_dir));
}

#[test]
fn test_chained_patches() {
    let temp = TempDir::new().unwrap();
    let v1 = temp.path().join("v1");
    let v2 = temp.path().join("v2");
    let v3 = temp.path().join("v3");
    let target_dir = temp.path().join("target");
    let first = temp.path().join("1to2.patch");
    let second = temp.path().join("2to3.patch");

    write_tree(&v1, &[("app.bin", &vec![1u8; 5000]), ("notes.txt", b"v1")]);
    write_tree(&v2, &[("app.bin", &vec![2u8; 5000]), ("notes.txt", b"v2")]);
    write_tree(&v3, &[("app.bin", &vec![2u8; 6000]), ("plugins/p.dll", b"plugin")]);
    copy_tree(&v1, &target_dir);

    create(&v1, &v2, &first, "gzip");
    create(&v2, &v3, &second, "bzip2");

    let output = treedelta(&[
        "apply",
        "--target",
        path(&target_dir),
        "--patch",
        path(&first),
        path(&second),
    ]);
    assert_success(&output, "treedelta apply");

    assert_eq!(fingerprint(&v3), fingerprint(&target_dir));
}

#[test]
fn test_corrupted_patch_is_rejected() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let target_dir = temp.path().join("target");
    let patch_file = temp.path().join("test.patch");

    write_tree(&old_dir, &[("a.txt", b"original contents")]);
    write_tree(&new_dir, &[("a.txt", b"changed contents"), ("b.txt", b"added")]);
    copy_tree(&old_dir, &target_dir);

    create(&old_dir, &new_dir, &patch_file, "gzip");
    let mut bytes = fs::read(&patch_file).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&patch_file, &bytes).unwrap();

    let output = treedelta(&["apply", "--target", path(&target_dir), "--patch", path(&patch_file)]);
    assert!(!output.status.success(), "a corrupted patch must not apply");
    assert!(String::from_utf8_lossy(&output.stderr).contains("checksum mismatch"));
    assert_eq!(fingerprint(&old_dir), fingerprint(&target_dir));
}
