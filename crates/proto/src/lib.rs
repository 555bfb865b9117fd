//! Generated gRPC client/server stubs for the coordinator/agent control
//! plane, plus the `CaptureInfo` wire message used to ship paired latency
//! observations back to the coordinator.

tonic::include_proto!("tricorder");
