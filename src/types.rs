use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrateStateKind {
    OnFloor,
    Carried,
}

/// Ownership state of a crate. The carrier only exists while carried, so a
/// carried crate without a carrier cannot be represented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrateState {
    OnFloor,
    Carried { carrier_id: String },
}

impl CrateState {
    pub fn carried_by(carrier_id: impl Into<String>) -> Self {
        Self::Carried {
            carrier_id: carrier_id.into(),
        }
    }

    pub fn kind(&self) -> CrateStateKind {
        match self {
            Self::OnFloor => CrateStateKind::OnFloor,
            Self::Carried { .. } => CrateStateKind::Carried,
        }
    }

    pub fn carrier_id(&self) -> Option<&str> {
        match self {
            Self::OnFloor => None,
            Self::Carried { carrier_id } => Some(carrier_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "CrateRecord", from = "CrateRecord")]
pub struct Crate {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub state: CrateState,
}

impl Crate {
    pub fn on_floor(id: impl Into<String>, x: i32, y: i32) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            state: CrateState::OnFloor,
        }
    }
}

/// Flat wire/storage form of a crate: `{id, x, y, state, carrierId}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrateRecord {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub state: CrateStateKind,
    #[serde(rename = "carrierId", alias = "carrier_id", default)]
    pub carrier_id: Option<String>,
}

impl From<Crate> for CrateRecord {
    fn from(value: Crate) -> Self {
        let state = value.state.kind();
        let carrier_id = match value.state {
            CrateState::OnFloor => None,
            CrateState::Carried { carrier_id } => Some(carrier_id),
        };
        Self {
            id: value.id,
            x: value.x,
            y: value.y,
            state,
            carrier_id,
        }
    }
}

impl From<CrateRecord> for Crate {
    /// A record that breaks the carrier invariant (carried without a carrier,
    /// or a blank carrier) comes back on the floor.
    fn from(value: CrateRecord) -> Self {
        let carrier = value
            .carrier_id
            .map(|carrier| carrier.trim().to_string())
            .filter(|carrier| !carrier.is_empty());
        let state = match (value.state, carrier) {
            (CrateStateKind::Carried, Some(carrier_id)) => CrateState::Carried { carrier_id },
            _ => CrateState::OnFloor,
        };
        Self {
            id: value.id,
            x: value.x,
            y: value.y,
            state,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerState {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub score: i64,
}

impl PlayerState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            x: 0,
            y: 0,
            score: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionView {
    pub x: i32,
    pub y: i32,
}

/// Axis-aligned rectangle where carried crates can be turned in. Bounds are
/// inclusive on every side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryZone {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl DeliveryZone {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.x0 <= x && x <= self.x1 && self.y0 <= y && y <= self.y1
    }

    pub fn intersects_rect(&self, x: i32, y: i32, width: i32, height: i32) -> bool {
        x <= self.x1 && x + width >= self.x0 && y <= self.y1 && y + height >= self.y0
    }
}

impl fmt::Display for DeliveryZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x0, self.y0, self.x1, self.y1)
    }
}

impl FromStr for DeliveryZone {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts = raw
            .split(',')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| format!("invalid zone coordinate: {error}"))?;
        match parts.as_slice() {
            [x0, y0, x1, y1] => Ok(Self::new(*x0, *y0, *x1, *y1)),
            _ => Err(format!(
                "expected four comma separated values x0,y0,x1,y1, got {}",
                parts.len()
            )),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub crates: Vec<Crate>,
    pub scores: BTreeMap<String, i64>,
    pub positions: BTreeMap<String, PositionView>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpdatePositionRequest {
    #[serde(default)]
    pub player: String,
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CrateActionRequest {
    #[serde(default)]
    pub player: String,
    #[serde(
        rename = "crateId",
        alias = "crate_id",
        alias = "item",
        default
    )]
    pub crate_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<i64>,
}

impl ActionResponse {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            score: None,
        }
    }

    pub fn with_score(message: impl Into<String>, score: i64) -> Self {
        Self {
            message: message.into(),
            score: Some(score),
        }
    }
}
