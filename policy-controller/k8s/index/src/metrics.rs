use crate::Index;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(Index);

pub fn register(reg: &mut Registry, index: Index) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut hosts_encoder = encoder.encode_descriptor(
            "host_index_size",
            "The number of hosts routed to a policy",
            None,
            MetricType::Gauge,
        )?;
        for (ns, count) in this.host_counts() {
            let labels = [("namespace", ns)];
            let hosts = ConstGauge::new(count as u32);
            hosts.encode(hosts_encoder.encode_family(&labels)?)?;
        }

        let mut pipelines_encoder = encoder.encode_descriptor(
            "pipeline_index_size",
            "The number of published authorization pipelines",
            None,
            MetricType::Gauge,
        )?;
        for (ns, count) in this.pipeline_counts() {
            let labels = [("namespace", ns)];
            let pipelines = ConstGauge::new(count as u32);
            pipelines.encode(pipelines_encoder.encode_family(&labels)?)?;
        }

        Ok(())
    }
}
