use crate::models::Vehicle;

/// Client-supplied predicate over vehicles
///
/// An unset field matches everything. Query strings send empty values for
/// absent fields, so empty strings are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleFilter {
    pub vehicle_type: Option<String>,
    pub group_id: Option<i64>,
}

impl VehicleFilter {
    pub fn new(vehicle_type: Option<String>, group_id: Option<i64>) -> Self {
        Self {
            vehicle_type: vehicle_type.filter(|t| !t.trim().is_empty()),
            group_id,
        }
    }

    /// Parse the raw `vehicle_type` / `vehicle_group_id` query values.
    /// Fails with the offending value when the group id is not an integer.
    pub fn from_query(vehicle_type: Option<&str>, group_id: Option<&str>) -> Result<Self, String> {
        let group_id = match group_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| raw.to_string())?),
            None => None,
        };

        Ok(Self::new(vehicle_type.map(str::to_string), group_id))
    }

    pub fn is_empty(&self) -> bool {
        self.vehicle_type.is_none() && self.group_id.is_none()
    }

    pub fn matches(&self, vehicle: &Vehicle) -> bool {
        if let Some(ref vehicle_type) = self.vehicle_type {
            if vehicle.vehicle_type.as_str() != vehicle_type {
                return false;
            }
        }

        if let Some(group_id) = self.group_id {
            if !vehicle.in_group(group_id) {
                return false;
            }
        }

        true
    }
}
