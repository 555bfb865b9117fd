#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("opening capture device {device}: {source}")]
    OpenDevice { device: String, source: pcap::Error },
    #[error("setting BPF filter {filter:?}: {source}")]
    SetFilter { filter: String, source: pcap::Error },
}
