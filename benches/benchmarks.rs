//! Benchmark suite for mender's hot paths.
//!
//! This module provides performance benchmarks for:
//! - Failure parsing (large test logs)
//! - Signature computation (normalize + hash)
//! - Diff application (in-memory hunk matching)
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```
//!
//! Criterion writes JSON estimates and HTML reports to `target/criterion/`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mender::parser::FailureParser;
use mender::patch::UnifiedPatch;
use mender::signature::{normalize, signature_of};

// ============================================================================
// Parser Benchmarks
// ============================================================================

/// Benchmark parsing test output with a growing number of failures.
fn bench_failure_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("failure_parsing");
    let parser = FailureParser::new();

    for failures in [10, 100, 1000] {
        let output = mixed_test_output(failures);
        group.throughput(Throughput::Bytes(output.len() as u64));
        group.bench_with_input(BenchmarkId::new("mixed_dialects", failures), &output, |b, out| {
            b.iter(|| black_box(parser.parse(black_box(out))));
        });
    }

    group.finish();
}

// ============================================================================
// Signature Benchmarks
// ============================================================================

/// Benchmark normalization and hashing for contexts of various sizes.
fn bench_signatures(c: &mut Criterion) {
    let mut group = c.benchmark_group("signatures");
    let error = "AssertionError: object at 0x7f3a2b4c1d00 at line 42 != expected";

    for lines in [16, 128, 1024] {
        let context = source_lines(lines);
        group.throughput(Throughput::Bytes(context.len() as u64));
        group.bench_with_input(BenchmarkId::new("signature_of", lines), &context, |b, ctx| {
            b.iter(|| black_box(signature_of(black_box(error), black_box(ctx))));
        });
    }

    group.bench_function("normalize_error", |b| {
        b.iter(|| black_box(normalize(black_box(error))));
    });

    group.finish();
}

// ============================================================================
// Diff Application Benchmarks
// ============================================================================

/// Benchmark applying a single-hunk patch whose offset has drifted.
fn bench_diff_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_apply");

    for lines in [100, 1000, 10_000] {
        let source = source_lines(lines);
        let target = lines / 2;
        // Stated position is off by 25 lines so the outward search has work to do.
        let patch_text = format!(
            "--- a/big.py\n+++ b/big.py\n@@ -{},2 +{},2 @@\n def function_{}():\n-    return {}\n+    return {} + 1\n",
            target.saturating_sub(25).max(1),
            target.saturating_sub(25).max(1),
            target / 2,
            target / 2,
            target / 2
        );
        let patch = UnifiedPatch::parse(&patch_text).expect("benchmark patch parses");

        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::new("drifted_hunk", lines), &source, |b, src| {
            b.iter(|| black_box(patch.files[0].apply_to(Some(black_box(src)))));
        });
    }

    group.bench_function("parse_patch", |b| {
        let text = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n";
        b.iter(|| black_box(UnifiedPatch::parse(black_box(text))));
    });

    group.finish();
}

// ============================================================================
// Helpers
// ============================================================================

/// `lines` lines of Python, two per function.
fn source_lines(lines: usize) -> String {
    let mut out = String::with_capacity(lines * 24);
    for i in 0..lines / 2 {
        out.push_str(&format!("def function_{}():\n    return {}\n", i, i));
    }
    out
}

/// Test output mixing the simple, structured and cargo dialects.
fn mixed_test_output(failures: usize) -> String {
    let mut out = String::new();
    for i in 0..failures {
        match i % 3 {
            0 => out.push_str(&format!(
                "FAILED tests/test_mod_{i}.py::test_case_{i} - AssertionError: {i} != {}\n",
                i + 1
            )),
            1 => out.push_str(&format!(
                "File: src/mod_{i}.ts\nTest: case {i}\nError: expected {i} to equal {}\n\n",
                i + 1
            )),
            _ => out.push_str(&format!(
                "---- tests::case_{i} stdout ----\nthread 'tests::case_{i}' panicked at src/lib.rs:{i}:5:\nassertion failed: left == right\n\n"
            )),
        }
        out.push_str("some unrelated log line\n");
    }
    out
}

criterion_group!(benches, bench_failure_parsing, bench_signatures, bench_diff_apply);
criterion_main!(benches);
