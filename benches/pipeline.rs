//! Criterion benchmarks for pyautofix performance testing.
//!
//! These benchmarks invoke the release binary as a subprocess against a saved
//! pylint report, so they measure process startup, parsing, symbol collection,
//! repair and diff rendering without depending on pylint or autopep8.

use criterion::{Criterion, criterion_group, criterion_main};
use std::path::Path;
use std::process::Command;

const SOURCE: &str = "tests/fixtures/typo.py";
const REPORT: &str = "tests/fixtures/typo.pylint.txt";

fn fixtures_present(bench: &str) -> bool {
    for file in [SOURCE, REPORT] {
        if !Path::new(file).exists() {
            eprintln!("Skipping {}: {} not found", bench, file);
            return false;
        }
    }
    true
}

/// Benchmark the default report rendering
fn bench_report(c: &mut Criterion) {
    if !fixtures_present("report") {
        return;
    }

    c.bench_function("report", |b| {
        b.iter(|| {
            Command::new("./target/release/pyautofix")
                .args(["--no-config", "--no-format", "--color", "never"])
                .args(["--lint-report", REPORT, SOURCE])
                .output()
                .expect("Failed to execute pyautofix")
        })
    });
}

/// Benchmark aligned diff mode with identifier replacement
fn bench_aligned_identifier(c: &mut Criterion) {
    if !fixtures_present("aligned_identifier") {
        return;
    }

    c.bench_function("aligned_identifier", |b| {
        b.iter(|| {
            Command::new("./target/release/pyautofix")
                .args(["--no-config", "--no-format", "--corrected"])
                .args(["--diff-mode", "aligned", "--replace-mode", "identifier"])
                .args(["--lint-report", REPORT, SOURCE])
                .output()
                .expect("Failed to execute pyautofix")
        })
    });
}

/// Benchmark JSON output (tests serialization overhead)
fn bench_json(c: &mut Criterion) {
    if !fixtures_present("json") {
        return;
    }

    c.bench_function("json", |b| {
        b.iter(|| {
            Command::new("./target/release/pyautofix")
                .args(["--no-config", "--no-format", "--json"])
                .args(["--lint-report", REPORT, SOURCE])
                .output()
                .expect("Failed to execute pyautofix")
        })
    });
}

criterion_group!(benches, bench_report, bench_aligned_identifier, bench_json);
criterion_main!(benches);
