use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    FlowForecast,
    AnomalyDetection,
    Efficiency,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::FlowForecast,
        ModelKind::AnomalyDetection,
        ModelKind::Efficiency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::FlowForecast => "flow_forecast",
            ModelKind::AnomalyDetection => "anomaly_detection",
            ModelKind::Efficiency => "efficiency",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "flow_forecast" => Some(ModelKind::FlowForecast),
            "anomaly_detection" => Some(ModelKind::AnomalyDetection),
            "efficiency" => Some(ModelKind::Efficiency),
            _ => None,
        }
    }
}

/// Linear model lifecycle. Promotion may skip the shadow stage; every
/// other edge is rejected at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Created,
    Training,
    Validating,
    Shadow,
    Active,
    Retired,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Created => "created",
            ModelStatus::Training => "training",
            ModelStatus::Validating => "validating",
            ModelStatus::Shadow => "shadow",
            ModelStatus::Active => "active",
            ModelStatus::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "created" => Some(ModelStatus::Created),
            "training" => Some(ModelStatus::Training),
            "validating" => Some(ModelStatus::Validating),
            "shadow" => Some(ModelStatus::Shadow),
            "active" => Some(ModelStatus::Active),
            "retired" => Some(ModelStatus::Retired),
            _ => None,
        }
    }

    pub fn can_transition(self, next: ModelStatus) -> bool {
        matches!(
            (self, next),
            (ModelStatus::Created, ModelStatus::Training)
                | (ModelStatus::Training, ModelStatus::Validating)
                | (ModelStatus::Validating, ModelStatus::Shadow)
                | (ModelStatus::Validating, ModelStatus::Active)
                | (ModelStatus::Shadow, ModelStatus::Active)
                | (ModelStatus::Active, ModelStatus::Retired)
        )
    }

    /// States a promotion candidate may currently be in.
    pub fn is_promotable(self) -> bool {
        matches!(self, ModelStatus::Validating | ModelStatus::Shadow)
    }
}
