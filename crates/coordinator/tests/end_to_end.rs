use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tonic::{Request, Response, Status};
use tricorder_coordinator::agents;
use tricorder_coordinator::store::{Histogram, Store};
use tricorder_proto::agent_server::{Agent, AgentServer};
use tricorder_proto::{
    AgentResults, CaptureAck, CaptureInfo, CaptureSignal, GoodByeAck, GoodByeSignal, ResultsRequest,
};

/// A stand-in agent that always returns the same fixed capture map,
/// exercising the coordinator's RPC client against a real gRPC server
/// without needing a live packet capture.
struct MockAgent {
    capture_map: HashMap<String, CaptureInfo>,
}

#[tonic::async_trait]
impl Agent for MockAgent {
    async fn start_capture(&self, _request: Request<CaptureSignal>) -> Result<Response<CaptureAck>, Status> {
        Ok(Response::new(CaptureAck { status: "success".into() }))
    }

    async fn get_results(&self, _request: Request<ResultsRequest>) -> Result<Response<AgentResults>, Status> {
        Ok(Response::new(AgentResults { status: "success".into(), capture_map: self.capture_map.clone() }))
    }

    async fn goodbye(&self, _request: Request<GoodByeSignal>) -> Result<Response<GoodByeAck>, Status> {
        Ok(Response::new(GoodByeAck { status: "success".into() }))
    }
}

async fn spawn_mock_agent(capture_map: HashMap<String, CaptureInfo>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(AgentServer::new(MockAgent { capture_map }))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    // give the server a moment to start accepting connections
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

fn capture_info(opaque: &str, oplatency: &str, key: &str) -> CaptureInfo {
    CaptureInfo { opaque: opaque.into(), oplatency: oplatency.into(), key: key.into() }
}

/// End-to-end scenario 5: two agents report the same composite key with
/// identical latencies; the merged row carries both columns and the
/// histogram records both samples.
#[tokio::test]
async fn coordinator_merge_across_two_real_agents() {
    let map = HashMap::from([("42_7".to_string(), capture_info("42", "500", "foo"))]);
    let addr_a = spawn_mock_agent(map.clone()).await;
    let addr_b = spawn_mock_agent(map).await;

    let mut agent_list =
        agents::connect_all(&[addr_a.to_string(), addr_b.to_string()], Duration::from_secs(5)).await.unwrap();

    agents::start_capture_all(&mut agent_list).await.unwrap();
    agents::get_results_all(&mut agent_list).await.unwrap();

    let db_path = format!("{}/tricorder-e2e-merge-{}.db", std::env::temp_dir().display(), std::process::id());
    let store = Store::open(&db_path, 2).unwrap();
    let histogram = Histogram::new();

    store.merge_and_store(&mut agent_list, &histogram, 1_700_000_000_000).unwrap();

    let rows = store.all_rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["composite_key"], "42_7");
    assert_eq!(rows[0]["agent_0"], "500");
    assert_eq!(rows[0]["agent_1"], "500");
    assert_eq!(histogram.max(), 500);

    std::fs::remove_file(&db_path).ok();
}

/// A follower agent's goodbye is best-effort and never panics even against
/// a server that keeps accepting requests normally.
#[tokio::test]
async fn goodbye_all_is_best_effort_against_live_agents() {
    let addr = spawn_mock_agent(HashMap::new()).await;
    let mut agent_list = agents::connect_all(&[addr.to_string()], Duration::from_secs(5)).await.unwrap();
    agents::goodbye_all(&mut agent_list).await;
}
