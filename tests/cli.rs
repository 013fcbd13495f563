//! CLI test cases.
//!
//! Tests which need an OCR engine use a small shell script standing in for
//! `ocrmypdf`. It copies its input to its output, except for inputs whose
//! names ask for a specific failure.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;

/// Contents of a file which passes our PDF validation.
static TINY_PDF: &[u8] = b"%PDF-1.4\n%%EOF\n";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("ocr-batch").unwrap()
}

/// Create a new `Command` using a settings file in `dir`.
fn cmd_with_settings(dir: &Path) -> Command {
    let mut cmd = cmd();
    cmd.arg("--settings").arg(dir.join("settings.json"));
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_settings_set_get_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    cmd_with_settings(dir.path())
        .args(["settings", "set", "deskew", "Yes"])
        .assert()
        .success();
    cmd_with_settings(dir.path())
        .args(["settings", "get", "deskew"])
        .assert()
        .success()
        .stdout("true\n");
    cmd_with_settings(dir.path())
        .args(["settings", "set", "ocr_language", "eng+deu"])
        .assert()
        .success();
    cmd_with_settings(dir.path())
        .args(["settings", "get", "ocr_language"])
        .assert()
        .success()
        .stdout("eng+deu\n");

    cmd_with_settings(dir.path())
        .args(["settings", "reset"])
        .assert()
        .success();
    cmd_with_settings(dir.path())
        .args(["settings", "get", "deskew"])
        .assert()
        .success()
        .stdout("false\n");
}

#[test]
fn test_settings_rejects_bad_values() {
    let dir = tempfile::tempdir().unwrap();
    cmd_with_settings(dir.path())
        .args(["settings", "set", "no_such_setting", "1"])
        .assert()
        .failure();
    cmd_with_settings(dir.path())
        .args(["settings", "set", "jpeg_quality", "500"])
        .assert()
        .failure();
    cmd_with_settings(dir.path())
        .args(["settings", "set", "output_type", "tiff"])
        .assert()
        .failure();
}

#[test]
fn test_settings_export_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let export_path = dir.path().join("export.json");
    cmd_with_settings(dir.path())
        .args(["settings", "set", "jobs", "2"])
        .assert()
        .success();
    cmd_with_settings(dir.path())
        .args(["settings", "export"])
        .arg(&export_path)
        .assert()
        .success();

    let exported: Value =
        serde_json::from_str(&fs::read_to_string(&export_path).unwrap()).unwrap();
    assert_eq!(exported["jobs"], Value::from(2));
    assert_eq!(exported["output_type"], Value::from("pdf"));

    // Import into a fresh settings file, with a hand-written extra key.
    let other = tempfile::tempdir().unwrap();
    let import_path = other.path().join("import.json");
    fs::write(
        &import_path,
        r#"{ "jobs": "3", "clean": "yes", "window_geometry": null }"#,
    )
    .unwrap();
    cmd_with_settings(other.path())
        .args(["settings", "import"])
        .arg(&import_path)
        .assert()
        .success();
    cmd_with_settings(other.path())
        .args(["settings", "get", "jobs"])
        .assert()
        .success()
        .stdout("3\n");
    cmd_with_settings(other.path())
        .args(["settings", "get", "clean"])
        .assert()
        .success()
        .stdout("true\n");
}

#[test]
fn test_schema() {
    cmd()
        .args(["schema", "Settings"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ocr_language"));
    cmd()
        .args(["schema", "FileOutcome"])
        .assert()
        .success()
        .stdout(predicate::str::contains("output_path"));
}

#[test]
fn test_run_without_pdfs_fails() {
    let dir = tempfile::tempdir().unwrap();
    let not_pdf = dir.path().join("notes.txt");
    fs::write(&not_pdf, "hello").unwrap();
    cmd_with_settings(dir.path())
        .arg("run")
        .arg(&not_pdf)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no PDF files"));
}

#[test]
fn test_run_with_missing_engine_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("a.pdf");
    fs::write(&input, TINY_PDF).unwrap();
    cmd_with_settings(dir.path())
        .arg("run")
        .arg(&input)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .args(["--engine-command", "/nonexistent/ocrmypdf-for-tests"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not available"));
}

#[cfg(unix)]
mod fake_engine {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;

    /// A stand-in for `ocrmypdf`.
    static FAKE_OCRMYPDF: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "16.0.0-fake"
    exit 0
fi
# Our input and output are the last two arguments.
for arg; do
    case "$arg" in
        -c|*=*) echo "ocrmypdf: error: unrecognized arguments: $arg" >&2; exit 1 ;;
        --tesseract-config) config=yes ;;
    esac
    input="$output"
    output="$arg"
done
if [ -n "$REQUIRE_TESSERACT_CONFIG" ] && [ -z "$config" ]; then
    echo "no --tesseract-config given" >&2
    exit 1
fi
case "$(basename "$input")" in
    *prior*) echo "PriorOcrFoundError: page already has text!" >&2; exit 6 ;;
    *encrypted*) echo "EncryptedPdfError" >&2; exit 8 ;;
    *boom*) echo "boom" >&2; exit 15 ;;
esac
cp "$input" "$output"
"#;

    /// Write the fake engine into `dir` and return its path.
    fn install_fake_engine(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("fake-ocrmypdf");
        fs::write(&path, FAKE_OCRMYPDF).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Parse JSONL output.
    fn parse_records(stdout: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(stdout)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_run_reports_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = install_fake_engine(dir.path());
        let inputs = dir.path().join("inputs");
        fs::create_dir(&inputs).unwrap();
        for name in ["a.pdf", "prior.pdf", "boom.pdf", "encrypted.pdf"] {
            fs::write(inputs.join(name), TINY_PDF).unwrap();
        }
        let out_dir = dir.path().join("out");

        let output = cmd_with_settings(dir.path())
            .arg("run")
            .arg(&inputs)
            .arg("--out-dir")
            .arg(&out_dir)
            .arg("--engine-command")
            .arg(&engine)
            .output()
            .unwrap();
        assert!(output.status.success());

        // Folders are expanded in name order.
        let records = parse_records(&output.stdout);
        let names = records
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a.pdf", "boom.pdf", "encrypted.pdf", "prior.pdf"]);

        let success = records
            .iter()
            .map(|r| r["success"].as_bool().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(success, [true, false, false, true]);
        assert!(records[1]["message"].as_str().unwrap().contains("boom"));
        assert!(records[2]["message"].as_str().unwrap().contains("encrypted"));

        assert_eq!(fs::read(out_dir.join("a_ocr.pdf")).unwrap(), TINY_PDF);
        assert_eq!(fs::read(out_dir.join("prior_ocr.pdf")).unwrap(), TINY_PDF);
        assert!(!out_dir.join("boom_ocr.pdf").exists());
    }

    #[test]
    fn test_run_never_overwrites_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = install_fake_engine(dir.path());
        let input = dir.path().join("a.pdf");
        fs::write(&input, TINY_PDF).unwrap();
        let out_dir = dir.path().join("out");
        fs::create_dir(&out_dir).unwrap();
        fs::write(out_dir.join("a_ocr.pdf"), "keep me").unwrap();

        let results = dir.path().join("results.jsonl");
        cmd_with_settings(dir.path())
            .arg("run")
            .arg(&input)
            .arg("--out-dir")
            .arg(&out_dir)
            .arg("--engine-command")
            .arg(&engine)
            .arg("--out")
            .arg(&results)
            .assert()
            .success();

        assert_eq!(fs::read_to_string(out_dir.join("a_ocr.pdf")).unwrap(), "keep me");
        assert_eq!(fs::read(out_dir.join("a_ocr_1.pdf")).unwrap(), TINY_PDF);
        let records = parse_records(&fs::read(&results).unwrap());
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_run_passes_tesseract_params_as_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = install_fake_engine(dir.path());
        let input = dir.path().join("a.pdf");
        fs::write(&input, TINY_PDF).unwrap();
        cmd_with_settings(dir.path())
            .args([
                "settings",
                "set",
                "tesseract_params",
                "-c preserve_interword_spaces=1",
            ])
            .assert()
            .success();

        let output = cmd_with_settings(dir.path())
            .arg("run")
            .arg(&input)
            .arg("--out-dir")
            .arg(dir.path().join("out"))
            .arg("--engine-command")
            .arg(&engine)
            .env("REQUIRE_TESSERACT_CONFIG", "1")
            .output()
            .unwrap();
        assert!(output.status.success());
        let records = parse_records(&output.stdout);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["success"], Value::Bool(true));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_run_fails_cleanly_when_results_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let engine = install_fake_engine(dir.path());
        let input = dir.path().join("a.pdf");
        fs::write(&input, TINY_PDF).unwrap();

        // Every write to `/dev/full` fails with "no space left on device".
        cmd_with_settings(dir.path())
            .arg("run")
            .arg(&input)
            .arg("--out-dir")
            .arg(dir.path().join("out"))
            .arg("--engine-command")
            .arg(&engine)
            .args(["--out", "/dev/full"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to"));
    }

    #[test]
    fn test_run_enforces_allowed_failure_rate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = install_fake_engine(dir.path());
        let input = dir.path().join("boom.pdf");
        fs::write(&input, TINY_PDF).unwrap();

        cmd_with_settings(dir.path())
            .arg("run")
            .arg(&input)
            .arg("--out-dir")
            .arg(dir.path().join("out"))
            .arg("--engine-command")
            .arg(&engine)
            .args(["--allowed-failure-rate", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("files failed"));
    }
}
