use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of measurements a monitoring node can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    FlowRate,
    Pressure,
    ReservoirLevel,
    Temperature,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::FlowRate,
        MetricKind::Pressure,
        MetricKind::ReservoirLevel,
        MetricKind::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::FlowRate => "flow_rate",
            MetricKind::Pressure => "pressure",
            MetricKind::ReservoirLevel => "reservoir_level",
            MetricKind::Temperature => "temperature",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "flow_rate" => Some(MetricKind::FlowRate),
            "pressure" => Some(MetricKind::Pressure),
            "reservoir_level" => Some(MetricKind::ReservoirLevel),
            "temperature" => Some(MetricKind::Temperature),
            _ => None,
        }
    }
}

/// Where a node sits in the network topology. Source nodes meter water
/// entering a zone, distribution nodes meter delivery, storage nodes meter
/// reservoir levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Distribution,
    Storage,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Distribution => "distribution",
            NodeKind::Storage => "storage",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "source" => Some(NodeKind::Source),
            "distribution" => Some(NodeKind::Distribution),
            "storage" => Some(NodeKind::Storage),
            _ => None,
        }
    }
}

/// One raw measurement as returned by the cold-tier warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub node_id: Uuid,
    pub ts: DateTime<Utc>,
    pub flow_rate: f64,
    pub pressure: f64,
    pub temperature: f64,
    pub cumulative_volume: f64,
    pub quality: f64,
}

impl SensorReading {
    /// The measurement carried by this reading for one metric kind. The
    /// cumulative volume meter doubles as the reservoir level on storage
    /// nodes.
    pub fn value(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::FlowRate => self.flow_rate,
            MetricKind::Pressure => self.pressure,
            MetricKind::ReservoirLevel => self.cumulative_volume,
            MetricKind::Temperature => self.temperature,
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct NodeRow {
    pub id: Uuid,
    pub name: String,
    pub zone: String,
    pub kind: String,
    pub active: bool,
}

pub async fn active_nodes(db: &sqlx::PgPool) -> Result<Vec<NodeRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, name, zone, kind, active
        FROM monitoring_nodes
        WHERE active = true
        ORDER BY name
        "#,
    )
    .fetch_all(db)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_kinds_round_trip() {
        for kind in [
            MetricKind::FlowRate,
            MetricKind::Pressure,
            MetricKind::ReservoirLevel,
            MetricKind::Temperature,
        ] {
            assert_eq!(MetricKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MetricKind::parse("turbidity"), None);
    }

    #[test]
    fn readings_expose_values_by_metric_kind() {
        let reading = SensorReading {
            node_id: Uuid::nil(),
            ts: DateTime::<Utc>::UNIX_EPOCH,
            flow_rate: 11.0,
            pressure: 4.2,
            temperature: 12.5,
            cumulative_volume: 130.0,
            quality: 1.0,
        };
        assert_eq!(reading.value(MetricKind::FlowRate), 11.0);
        assert_eq!(reading.value(MetricKind::Pressure), 4.2);
        assert_eq!(reading.value(MetricKind::Temperature), 12.5);
        assert_eq!(reading.value(MetricKind::ReservoirLevel), 130.0);
    }
}
