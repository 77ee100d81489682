use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn strongbox() -> Command {
    let mut cmd = Command::cargo_bin("strongbox").unwrap();
    cmd.env("STRONGBOX_PASSWORD", "test-password");
    cmd
}

#[test]
fn test_cli_full_cycle() {
    // 1. Setup a workspace with one input file
    let dir = tempdir().unwrap();
    let vault = dir.path().join("vault.sbx");
    let input = dir.path().join("notes.txt");
    fs::write(&input, "the quick brown fox").unwrap();

    // 2. Create the safe
    strongbox()
        .arg("create")
        .arg(&vault)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    assert!(vault.exists());

    // 3. Add the file under /docs with extra metadata
    strongbox()
        .arg("add")
        .arg(&vault)
        .arg(&input)
        .args(["--dest", "/docs/notes.txt"])
        .args(["--meta", "author=alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added /docs/notes.txt"));

    // 4. List shows the stored path
    strongbox()
        .arg("list")
        .arg(&vault)
        .assert()
        .success()
        .stdout(predicate::str::contains("/docs/notes.txt"))
        .stdout(predicate::str::contains("1 entries"));

    // 5. Metadata shows the reserved keys and the extra pair
    strongbox()
        .arg("metadata")
        .arg(&vault)
        .arg("/docs/notes.txt")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"/docs/notes.txt\""))
        .stdout(predicate::str::contains("\"author\": \"alice\""));

    // 6. Extract and compare byte for byte
    let restored = dir.path().join("restored.txt");
    strongbox()
        .arg("extract")
        .arg(&vault)
        .arg("/docs/notes.txt")
        .arg("--output")
        .arg(&restored)
        .assert()
        .success();
    assert_eq!(fs::read(&restored).unwrap(), fs::read(&input).unwrap());

    // 7. The integrity hash checks out
    strongbox()
        .arg("verify")
        .arg(&vault)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK: integrity hash matches."));

    // 8. Delete and confirm the listing is empty again
    strongbox()
        .arg("delete")
        .arg(&vault)
        .arg("/docs/notes.txt")
        .assert()
        .success();
    strongbox()
        .arg("list")
        .arg(&vault)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 entries"));
}

#[test]
fn test_cli_list_with_pattern() {
    let dir = tempdir().unwrap();
    let vault = dir.path().join("vault.sbx");
    strongbox().arg("create").arg(&vault).assert().success();

    for name in ["a.txt", "b.txt", "c.log"] {
        let input = dir.path().join(name);
        fs::write(&input, name).unwrap();
        strongbox()
            .arg("add")
            .arg(&vault)
            .arg(&input)
            .args(["--dest", &format!("/files/{}", name)])
            .assert()
            .success();
    }

    strongbox()
        .arg("list")
        .arg(&vault)
        .arg("/files/*.txt")
        .assert()
        .success()
        .stdout(predicate::str::contains("/files/a.txt"))
        .stdout(predicate::str::contains("/files/b.txt"))
        .stdout(predicate::str::contains("2 entries"));
}

#[test]
fn test_cli_wrong_password_is_an_error() {
    let dir = tempdir().unwrap();
    let vault = dir.path().join("vault.sbx");
    strongbox().arg("create").arg(&vault).assert().success();

    Command::cargo_bin("strongbox")
        .unwrap()
        .arg("list")
        .arg(&vault)
        .args(["--password", "not-the-password"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_cli_extract_missing_path_fails() {
    let dir = tempdir().unwrap();
    let vault = dir.path().join("vault.sbx");
    strongbox().arg("create").arg(&vault).assert().success();

    strongbox()
        .arg("extract")
        .arg(&vault)
        .arg("/nope.txt")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}
