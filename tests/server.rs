mod common;

use std::sync::Arc;

use rmcp::ServerHandler;

use drommage::git::GitLog;
use drommage::server::DrommageServer;

#[tokio::test]
async fn server_info_advertises_tools() {
    let orchestrator = Arc::new(common::orchestrator(vec![], 1));
    let dir = common::temp_dir("server");
    let server = DrommageServer::from_parts(orchestrator, GitLog::new(dir.clone()), dir.clone());

    let info = server.get_info();
    assert_eq!(info.server_info.name, "drommage");
    assert_eq!(info.server_info.version, env!("CARGO_PKG_VERSION"));
    assert!(info.capabilities.tools.is_some());
    assert!(info.instructions.unwrap().contains("analyze"));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn server_opens_cache_under_the_repository() {
    let dir = common::temp_dir("server-open");
    let config = drommage::config::Config::default();
    let server = DrommageServer::new(&config, dir.clone()).unwrap();

    assert!(config.db_path(&dir).exists());
    assert_eq!(server.orchestrator().stats().unwrap().total_versions, 0);
    assert_eq!(server.orchestrator().keep_versions(), 3);

    drop(server);
    std::fs::remove_dir_all(&dir).ok();
}
