//! Telemetry module tests.

use std::sync::Arc;

use gfx_core::memory::{
    AllocationProperties, AllocationType, BackendError, BackendOp, HardwareInfo, MemoryManager,
    MemorySettings, MockMemoryBackend,
};
use gfx_core::telemetry::{init_logging, LogConfig, LogError, LogFormat};

#[test]
fn log_config_default_is_json_at_info() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, "info");
    assert!(config.output_path.is_none());
}

// Installs the global subscriber; the only test in this binary that does.
#[test]
fn json_log_file_receives_allocation_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driver.log");
    let config = LogConfig {
        format: LogFormat::Json,
        level: "gfx_core=debug".to_string(),
        output_path: Some(path.clone()),
    };
    init_logging(&config).unwrap();
    assert!(matches!(init_logging(&config), Err(LogError::AlreadyInitialized)));

    let backend = Arc::new(MockMemoryBackend::default());
    backend.fail(BackendOp::SystemMemory, BackendError::Failed("exhausted".into()));
    let manager = MemoryManager::new(MemorySettings::default(), vec![HardwareInfo::integrated()], backend);
    let properties = AllocationProperties::new(0, 4096, AllocationType::Buffer, 1);
    assert!(manager.allocate_graphics_memory_with_properties(&properties).is_none());

    let contents = std::fs::read_to_string(&path).unwrap();
    let line = contents
        .lines()
        .find(|line| line.contains("Allocation failed"))
        .expect("failure event logged");
    let event: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(event["level"], "DEBUG");
    assert_eq!(event["fields"]["status"], "error");
}
