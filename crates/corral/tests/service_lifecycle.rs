//! End-to-end project lifecycle over a real directory tree.
//!
//! Run with: `cargo test -p corral --features test-support --test service_lifecycle`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;

use corral::config::ServiceConfig;
use corral::host::{OsFileSystem, RecordingWatcher};
use corral::project::kind::ProjectKind;
use corral::service::{Collaborators, ManualClock, ProjectService, ServiceEvent};
use corral::session::Session;
use corral::test_utils::fixture_workspace::{
    create_fixture_workspace, module_name, FixtureConfig, CONFIG_FILE,
};

fn os_service() -> (ProjectService, ManualClock, RecordingWatcher) {
    let config = ServiceConfig::default();
    let clock = ManualClock::new();
    let watcher = RecordingWatcher::new();
    let parts = Collaborators::line_language(
        Arc::new(OsFileSystem),
        Arc::new(watcher.clone()),
        Arc::new(clock.clone()),
    );
    (ProjectService::new(config, parts), clock, watcher)
}

fn full_text(text: &str) -> Vec<TextDocumentContentChangeEvent> {
    vec![TextDocumentContentChangeEvent {
        range: None,
        range_length: None,
        text: text.to_string(),
    }]
}

#[test]
fn test_fixture_workspace_loads_as_one_configured_project() {
    let config = FixtureConfig::small();
    let workspace = create_fixture_workspace(&config);
    let (mut service, _clock, watcher) = os_service();
    let main = workspace.path().join(module_name(0));
    let text = std::fs::read_to_string(&main).unwrap();

    let id = service.open_file(&main, &text, 1, None);
    let project = service.project(id).unwrap();
    assert_eq!(project.kind(), ProjectKind::Configured);
    assert_eq!(project.files().len(), config.file_count);
    assert!(watcher.watch_count(&workspace.path().join(CONFIG_FILE)) >= 1);

    let diagnostics = service
        .get_diagnostics(&main, &CancellationToken::new())
        .unwrap();
    assert!(diagnostics.is_empty(), "{:?}", diagnostics);
}

#[test]
fn test_edit_ripples_through_import_chain() {
    let config = FixtureConfig::small();
    let workspace = create_fixture_workspace(&config);
    let (mut service, _clock, _watcher) = os_service();
    let importer = workspace.path().join(module_name(2));
    let provider = workspace.path().join(module_name(3));
    for path in [&importer, &provider] {
        let text = std::fs::read_to_string(path).unwrap();
        service.open_file(path, &text, 1, None);
    }

    service
        .edit_file(&provider, 2, full_text("export fn renamed(x) {\n}\n"))
        .unwrap();
    let by_file = service
        .project_diagnostics(&importer, &CancellationToken::new())
        .unwrap();
    let messages: Vec<&str> = by_file
        .get(&importer)
        .map(|d| d.iter().map(|d| d.message.as_str()).collect())
        .unwrap_or_default();
    assert!(
        messages.iter().any(|m| m.contains("no exported member 'f_3_0'")),
        "{:?}",
        messages
    );
}

#[test]
fn test_new_file_on_disk_joins_after_debounce() {
    let config = FixtureConfig::small();
    let workspace = create_fixture_workspace(&config);
    let (mut service, clock, _watcher) = os_service();
    let main = workspace.path().join(module_name(0));
    let text = std::fs::read_to_string(&main).unwrap();
    let id = service.open_file(&main, &text, 1, None);

    let added = workspace.path().join("added.lm");
    std::fs::write(&added, "export const extra = 1\n").unwrap();
    service.on_file_event(&added);
    service.on_file_event(&added);

    clock.advance(service.config().watch_event_delay);
    assert!(service.run_pending() >= 1);
    clock.advance(service.config().graph_update_delay);
    service.run_pending();

    let project = service.project(id).unwrap();
    assert!(project.is_root(&added));
    assert!(project.contains(&added));
    assert!(service.take_events().iter().any(|e| matches!(
        e,
        ServiceEvent::BackgroundProjectsUpdated { open_files } if open_files.contains(&main)
    )));
}

#[test]
fn test_configuration_edits_move_open_files_between_projects() {
    let config = FixtureConfig::small();
    let workspace = create_fixture_workspace(&config);
    let (mut service, clock, _watcher) = os_service();
    let config_path = workspace.path().join(CONFIG_FILE);
    let main = workspace.path().join(module_name(0));
    let loose = workspace.path().join(module_name(config.file_count - 1));
    for path in [&main, &loose] {
        let text = std::fs::read_to_string(path).unwrap();
        service.open_file(path, &text, 1, None);
    }
    let configured = service.default_project(&main).unwrap();
    assert_eq!(service.default_project(&loose), Some(configured));

    let reload = |service: &mut ProjectService, text: String| {
        std::fs::write(&config_path, text).unwrap();
        service.on_file_event(&config_path);
        clock.advance(service.config().watch_event_delay);
        service.run_pending();
        clock.advance(service.config().graph_update_delay);
        service.run_pending();
    };

    reload(&mut service, format!(r#"{{ "files": ["{}"] }}"#, module_name(0)));
    assert_eq!(service.default_project(&main), Some(configured));
    let inferred = service.default_project(&loose).unwrap();
    assert_eq!(service.project(inferred).unwrap().kind(), ProjectKind::Inferred);
    assert!(service
        .get_diagnostics(&loose, &CancellationToken::new())
        .is_ok());

    reload(&mut service, "{}".to_string());
    assert_eq!(service.default_project(&loose), Some(configured));
    assert!(service.project(inferred).is_none());
}

#[test]
fn test_closing_last_file_retires_configured_project() {
    let workspace = create_fixture_workspace(&FixtureConfig::small());
    let (mut service, _clock, watcher) = os_service();
    let main = workspace.path().join(module_name(0));
    let text = std::fs::read_to_string(&main).unwrap();
    service.open_file(&main, &text, 1, None);

    service.close_file(&main).unwrap();
    assert_eq!(service.projects().count(), 0);
    assert!(service.records().is_empty());
    assert_eq!(watcher.total(), 0);
    assert!(service.trees().is_empty());
}

#[tokio::test]
async fn test_session_over_real_files() {
    let config = FixtureConfig::small();
    let workspace = create_fixture_workspace(&config);
    let service_config = ServiceConfig {
        diagnostics_delay: Duration::from_millis(1),
        ..ServiceConfig::default()
    };
    let parts = Collaborators::line_language(
        Arc::new(OsFileSystem),
        Arc::new(RecordingWatcher::new()),
        Arc::new(corral::service::RuntimeClock),
    );
    let (handle, mut events) = Session::spawn(ProjectService::new(service_config, parts));

    let files: Vec<PathBuf> = (0..2).map(|i| workspace.path().join(module_name(i))).collect();
    for path in &files {
        let text = std::fs::read_to_string(path).unwrap();
        handle.open(path.clone(), text, 1, None);
    }
    handle.check_open_files(Some(files[1].clone()));

    let mut reported = Vec::new();
    while reported.len() < files.len() {
        match events.recv().await {
            Some(ServiceEvent::DiagnosticsReady {
                path, diagnostics, ..
            }) => {
                assert!(diagnostics.is_empty(), "{:?}", diagnostics);
                reported.push(path);
            }
            Some(_) => {}
            None => panic!("session stopped"),
        }
    }
    assert_eq!(reported, vec![files[1].clone(), files[0].clone()]);
    handle.shutdown();
}
