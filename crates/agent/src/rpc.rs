use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tricorder_proto::agent_server::Agent as AgentService;
use tricorder_proto::{CaptureAck, CaptureInfo, CaptureSignal, GoodByeAck, GoodByeSignal, AgentResults, ResultsRequest};

use crate::capture::CapturePipeline;
use crate::config::InterfaceConfig;

/// gRPC-facing handle for this agent's capture pipeline. Each RPC maps
/// directly onto a `CapturePipeline` operation; see its doc comments for
/// the underlying lifecycle.
pub struct AgentHandle {
    pipeline: CapturePipeline,
    interface: InterfaceConfig,
}

impl AgentHandle {
    pub fn new(interface: InterfaceConfig) -> Self {
        AgentHandle { pipeline: CapturePipeline::new(), interface }
    }
}

#[tonic::async_trait]
impl AgentService for AgentHandle {
    async fn start_capture(
        &self,
        _request: Request<CaptureSignal>,
    ) -> Result<Response<CaptureAck>, Status> {
        let device = self.interface.device.clone();
        let port = self.interface.port;
        self.pipeline
            .start(&device, port)
            .map_err(|err| Status::internal(format!("starting capture: {err}")))?;
        tracing::info!(device, port, "capture started");
        Ok(Response::new(CaptureAck { status: "success".into() }))
    }

    async fn get_results(
        &self,
        _request: Request<ResultsRequest>,
    ) -> Result<Response<AgentResults>, Status> {
        let by_flow = self.pipeline.stop_and_collect();

        let mut capture_map = HashMap::new();
        for (flow_hash, samples) in by_flow {
            for sample in samples {
                let composite_key = format!("{}{}", sample.opaque, flow_hash);
                capture_map.insert(
                    composite_key,
                    CaptureInfo {
                        opaque: sample.opaque.to_string(),
                        oplatency: sample.latency_us.to_string(),
                        key: String::from_utf8_lossy(&sample.key).into_owned(),
                    },
                );
            }
        }

        tracing::info!(count = capture_map.len(), "returning capture results");
        Ok(Response::new(AgentResults { status: "success".into(), capture_map }))
    }

    async fn goodbye(
        &self,
        _request: Request<GoodByeSignal>,
    ) -> Result<Response<GoodByeAck>, Status> {
        self.pipeline.goodbye();
        tracing::info!("goodbye received, flow state discarded");
        Ok(Response::new(GoodByeAck { status: "success".into() }))
    }
}
