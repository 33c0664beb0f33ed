//! Tests for error types

use team_kernel::core::KernelError;

#[test]
fn test_pool_exhausted_error() {
    let err = KernelError::PoolExhausted("db".to_string());
    assert_eq!(format!("{err}"), "managed object pool `db` exhausted");
}

#[test]
fn test_queue_full_error() {
    let err = KernelError::QueueFull("io".to_string());
    assert_eq!(format!("{err}"), "queue full: io");
}

#[test]
fn test_task_panicked_error() {
    let err = KernelError::TaskPanicked {
        task: "parse".into(),
        message: "index out of bounds".into(),
    };
    assert_eq!(format!("{err}"), "task `parse` panicked: index out of bounds");
}

#[test]
fn test_escalation_depth_error() {
    let err = KernelError::EscalationDepth(16);
    assert_eq!(format!("{err}"), "escalation depth exceeded (16)");
}

#[test]
fn test_connection_errors() {
    assert_eq!(
        format!("{}", KernelError::Backpressure(4)),
        "connection 4 is applying backpressure"
    );
    assert_eq!(
        format!("{}", KernelError::ConnectionClosed(4)),
        "connection 4 is closed"
    );
}

#[test]
fn test_kernel_error_survives_anyhow() {
    let err: anyhow::Error = KernelError::Cancelled.into();
    let err = err.context("while binding");
    assert!(matches!(
        err.downcast_ref::<KernelError>(),
        Some(KernelError::Cancelled)
    ));
}
