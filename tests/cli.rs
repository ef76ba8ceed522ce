// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::process::Command;

fn bin() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("rv-lisp"))
}

fn source_file(src: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".rvl")
        .tempfile()
        .unwrap();
    file.write_all(src.as_bytes()).unwrap();
    file
}

const PROGRAM: &str = r"
(defun add2 (a b) (+ a b))
(add2 7 8)";

#[test]
fn compile_writes_a_deterministic_image() {
    let src = source_file(PROGRAM);
    let out_a = tempfile::NamedTempFile::new().unwrap();
    let out_b = tempfile::NamedTempFile::new().unwrap();

    bin()
        .args([
            "compile",
            src.path().to_str().unwrap(),
            "-o",
            out_a.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));

    bin()
        .args([
            "compile",
            src.path().to_str().unwrap(),
            "-o",
            out_b.path().to_str().unwrap(),
        ])
        .assert()
        .success();

    let a = fs::read(out_a.path()).unwrap();
    let b = fs::read(out_b.path()).unwrap();
    assert!(!a.is_empty());
    assert_eq!(a, b);
}

#[test]
fn check_json_reports_ok() {
    let src = source_file(PROGRAM);

    bin()
        .args(["check", src.path().to_str().unwrap(), "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\":true"));
}

#[test]
fn compile_error_exits_with_code_3() {
    let src = source_file("(let ((x 1) (x 2)) x)");
    let out = tempfile::NamedTempFile::new().unwrap();

    bin()
        .args([
            "compile",
            src.path().to_str().unwrap(),
            "-o",
            out.path().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn compile_error_json_envelope_carries_code() {
    let src = source_file("(undefined-fn 1)");
    let out = tempfile::NamedTempFile::new().unwrap();

    bin()
        .args([
            "compile",
            src.path().to_str().unwrap(),
            "-o",
            out.path().to_str().unwrap(),
            "--json",
        ])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"ok\":false"))
        .stdout(predicate::str::contains("\"code\":3"));
}

#[test]
fn missing_input_exits_with_code_5() {
    bin()
        .args(["check", "no-such-file.rvl"])
        .assert()
        .failure()
        .code(5);
}

#[test]
fn dump_lists_code_and_tables() {
    let src = source_file(PROGRAM);

    bin()
        .args(["dump", src.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("halt"))
        .stdout(predicate::str::contains("constants:"))
        .stdout(predicate::str::contains("add2"));
}
