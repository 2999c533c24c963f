// affected_files.rs - Benchmarks for project loading and incremental re-checking
//
// Run with: cargo bench --features test-support --bench affected_files
// Compare baselines: cargo bench --features test-support --bench affected_files -- --baseline before

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;

use corral::config::ServiceConfig;
use corral::service::ProjectService;
use corral::session::Session;
use corral::test_utils::fixture_workspace::{
    generate_module, module_name, write_memory_workspace, FixtureConfig,
};
use corral::test_utils::memory_service;

fn presets() -> Vec<(&'static str, FixtureConfig)> {
    vec![
        ("small", FixtureConfig::small()),
        ("medium", FixtureConfig::medium()),
        ("large", FixtureConfig::large()),
    ]
}

/// A service with `module_0` open in a loaded workspace under `/bench`
fn loaded_service(config: &FixtureConfig) -> (ProjectService, PathBuf) {
    let (mut service, fs, _clock) = memory_service(ServiceConfig::default());
    let root = Path::new("/bench");
    write_memory_workspace(&fs, root, config);
    let main = root.join(module_name(0));
    service.open_file(&main, &generate_module(0, config), 1, None);
    (service, main)
}

// ---------------------------------------------------------------------------
// Benchmark: initial load of a configured project (parse, resolve, check)
// ---------------------------------------------------------------------------

fn bench_initial_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("initial_load");
    group.sample_size(20);

    for (name, config) in presets() {
        group.bench_with_input(BenchmarkId::new("workspace", name), &config, |b, config| {
            b.iter(|| {
                let (mut service, main) = loaded_service(config);
                black_box(
                    service
                        .project_diagnostics(&main, &CancellationToken::new())
                        .map(|d| d.len())
                        .unwrap_or(0),
                )
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: edit the last module of the import chain and re-check the
// project. Only the chain's files are affected.
// ---------------------------------------------------------------------------

fn bench_edit_recheck(c: &mut Criterion) {
    let mut group = c.benchmark_group("edit_recheck");
    group.sample_size(20);

    for (name, config) in presets() {
        let (mut service, main) = loaded_service(&config);
        let tail_index = config.import_chain_depth.min(config.file_count - 1);
        let tail = Path::new("/bench").join(module_name(tail_index));
        let tail_text = generate_module(tail_index, &config);
        service.open_file(&tail, &tail_text, 1, None);
        let _ = service.project_diagnostics(&main, &CancellationToken::new());

        let mut version = 1;
        group.bench_function(BenchmarkId::new("workspace", name), |b| {
            b.iter(|| {
                version += 1;
                let text = format!("{}\nexport const v{} = 1\n", tail_text, version);
                let change = TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text,
                };
                if service.edit_file(&tail, version, vec![change]).is_ok() {
                    black_box(
                        service
                            .project_diagnostics(&main, &CancellationToken::new())
                            .map(|d| d.len())
                            .unwrap_or(0),
                    );
                }
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: diagnostics query round trip through the session worker
// ---------------------------------------------------------------------------

fn bench_session_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_query");
    group.sample_size(20);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => panic!("Failed to build tokio runtime: {}", e),
    };
    for (name, config) in presets() {
        let (service, main) = loaded_service(&config);
        let handle = {
            let _guard = runtime.enter();
            Session::spawn(service).0
        };
        group.bench_function(BenchmarkId::new("workspace", name), |b| {
            b.to_async(&runtime).iter(|| {
                let handle = handle.clone();
                let main = main.clone();
                async move { black_box(handle.diagnostics(main).await.map(|d| d.len())) }
            });
        });
        handle.shutdown();
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_initial_load,
    bench_edit_recheck,
    bench_session_query
);
criterion_main!(benches);
