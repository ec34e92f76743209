//! Integration tests for workspace, port and environment isolation

mod common;

use std::collections::BTreeMap;

use common::{git, setup_test_git_repo, test_config};
use drover::domain::models::ExecutionId;
use drover::domain::DomainError;
use drover::services::isolation::PortPool;
use drover::services::IsolationManager;

fn manager(repo: &std::path::Path, pool_size: u16) -> IsolationManager {
    let mut config = test_config(repo).isolation;
    config.port_pool_size = pool_size;
    let pool = PortPool::new(pool_size, config.primary_port_base, config.secondary_port_base)
        .without_port_check();
    let ambient = BTreeMap::from([
        ("PATH".to_string(), "/usr/bin".to_string()),
        ("AWS_SECRET_ACCESS_KEY".to_string(), "leak".to_string()),
    ]);
    IsolationManager::new(config)
        .with_port_pool(pool)
        .with_ambient_env(ambient)
}

fn id(raw: &str) -> ExecutionId {
    ExecutionId::parse(raw).unwrap()
}

#[tokio::test]
async fn test_acquire_creates_worktree_with_scoped_env() {
    common::setup_test_logging();
    let (_dir, repo) = setup_test_git_repo();
    let isolation = manager(&repo, 15);
    let head = git(&repo, &["rev-parse", "HEAD"]);

    let ctx = isolation.acquire("Core API", &id("a1b2c3d4"), None).await.unwrap();

    assert_eq!(ctx.workspace, "core-api");
    assert_eq!(ctx.branch, "drover/core-api");
    assert_eq!(ctx.path, repo.join(".drover/worktrees/core-api"));
    assert!(ctx.path.join(".git").is_file());
    assert_eq!(ctx.base_commit, head);

    let port_file = std::fs::read_to_string(ctx.path.join(".env.ports")).unwrap();
    assert!(port_file.contains(&format!("DROVER_PORT={}", ctx.ports.primary)));
    // The port file never shows up as work to commit.
    assert_eq!(git(&ctx.path, &["status", "--porcelain"]), "");

    assert_eq!(ctx.env.get("PATH").map(String::as_str), Some("/usr/bin"));
    assert!(!ctx.env.contains_key("AWS_SECRET_ACCESS_KEY"));
    assert_eq!(ctx.env["DROVER_EXECUTION_ID"], "a1b2c3d4");
    assert_eq!(ctx.env["PORT"], ctx.ports.primary.to_string());
    assert_eq!(
        ctx.ports.secondary - ctx.ports.primary,
        5100 - 4100,
        "pairs share one offset"
    );
}

#[tokio::test]
async fn test_workspace_reused_and_env_files_layered() {
    let (_dir, repo) = setup_test_git_repo();
    let isolation = manager(&repo, 15);

    let first = isolation.acquire("web", &id("a1b2c3d4"), None).await.unwrap();
    std::fs::write(first.path.join("scratch.txt"), "left behind\n").unwrap();
    std::fs::write(first.path.join(".env"), "DATABASE_URL=postgres://env\nMODE=dev\n").unwrap();
    std::fs::write(first.path.join(".env.local"), "MODE=local\nDROVER_PORT=1\n").unwrap();
    isolation.release(&id("a1b2c3d4")).await;

    let second = isolation.acquire("web", &id("b5c6d7e8"), None).await.unwrap();
    assert_eq!(second.path, first.path);
    assert!(second.path.join("scratch.txt").exists());
    assert_eq!(second.env["DATABASE_URL"], "postgres://env");
    assert_eq!(second.env["MODE"], "local");
    assert_eq!(second.env["DROVER_PORT"], second.ports.primary.to_string());
    assert_eq!(second.env["DROVER_EXECUTION_ID"], "b5c6d7e8");
}

#[tokio::test]
async fn test_busy_workspace_and_override_lanes() {
    let (_dir, repo) = setup_test_git_repo();
    let isolation = manager(&repo, 15);

    isolation.acquire("api", &id("a1b2c3d4"), None).await.unwrap();
    let err = isolation.acquire("api", &id("b5c6d7e8"), None).await.unwrap_err();
    assert!(matches!(err, DomainError::WorkspaceBusy { ref holder, .. } if holder == "a1b2c3d4"));

    // A group pointed at another workspace is not blocked by "api".
    let shared = isolation
        .acquire("docs", &id("c9d0e1f2"), Some("Shared Docs"))
        .await
        .unwrap();
    assert_eq!(shared.workspace, "shared-docs");

    let err = isolation.remove_workspace("api").await.unwrap_err();
    assert!(matches!(err, DomainError::WorkspaceBusy { .. }));
    isolation.release(&id("a1b2c3d4")).await;
    assert!(isolation.remove_workspace("api").await.unwrap());
    assert!(!repo.join(".drover/worktrees/api").exists());
}

#[tokio::test]
async fn test_port_pool_exhaustion_releases_workspace() {
    let (_dir, repo) = setup_test_git_repo();
    let isolation = manager(&repo, 1);

    let held = isolation.acquire("one", &id("a1b2c3d4"), None).await.unwrap();
    let err = isolation.acquire("two", &id("b5c6d7e8"), None).await.unwrap_err();
    assert!(matches!(err, DomainError::PortPoolExhausted { pool_size: 1 }));
    assert_eq!(isolation.active_count().await, 1);

    isolation.release(&held.execution_id).await;
    let next = isolation.acquire("two", &id("b5c6d7e8"), None).await.unwrap();
    assert_eq!(next.ports, held.ports);
}

#[tokio::test]
async fn test_same_id_keeps_its_ports() {
    let (_dir, repo) = setup_test_git_repo();
    let isolation = manager(&repo, 15);

    let first = isolation.acquire("api", &id("a1b2c3d4"), None).await.unwrap();
    let again = isolation.acquire("api", &id("a1b2c3d4"), None).await.unwrap();
    assert_eq!(first.ports, again.ports);
    assert_eq!(isolation.active_count().await, 1);
}
