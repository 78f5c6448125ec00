use anyhow::Result;
use playtrace_core::{SinkConfig, SinkKind};
use playtrace_engine::SessionSink;
use std::time::Duration;

mod influx;
mod jsonl;

pub use influx::{encode_line, InfluxSink};
pub use jsonl::JsonLinesSink;

pub fn build_sink(cfg: &SinkConfig, timeout: Duration) -> Result<Box<dyn SessionSink>> {
    let sink: Box<dyn SessionSink> = match cfg.kind {
        SinkKind::Influx => Box::new(InfluxSink::new(cfg, timeout)?),
        SinkKind::Stdout => Box::new(JsonLinesSink::stdout()),
    };
    Ok(sink)
}
