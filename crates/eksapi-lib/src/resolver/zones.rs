//! Availability-zone selection for the infrastructure stack

use std::collections::{BTreeSet, HashMap};

use tracing::info;

use crate::cloud::{CapacityReservationFilter, CloudClients};
use crate::error::{Error, Result};

/// Number of AZs the infrastructure stack spreads subnets over
pub const INFRA_AZ_COUNT: usize = 2;

/// Environment variable holding the operator's preferred AZ order
pub const AZ_PRIORITY_ENV: &str = "EKSAPI_AZ_PRIORITY";

/// Inputs to zone selection
#[derive(Debug, Clone, Default)]
pub struct ZoneRequest {
    pub instance_types: Vec<String>,
    pub availability_zones: Vec<String>,
    pub capacity_reservation: bool,
    pub capacity_reservation_id: Option<String>,
    pub node_count: u32,
    pub zone_type: String,
    /// Preferred order; zones not listed keep their relative order after these
    pub hinted_order: Vec<String>,
}

/// Read the operator-provided AZ priority list from the environment
pub fn hinted_order_from_env() -> Vec<String> {
    std::env::var(AZ_PRIORITY_ENV)
        .map(|v| parse_hint_list(&v))
        .unwrap_or_default()
}

fn parse_hint_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Stable reorder of `azs` so hinted zones come first, in hint order
pub fn apply_hinted_order(azs: Vec<String>, hints: &[String]) -> Vec<String> {
    if hints.is_empty() {
        return azs;
    }
    let mut ordered = azs;
    ordered.sort_by_key(|az| hints.iter().position(|h| h == az).unwrap_or(usize::MAX));
    ordered
}

/// Rank zones by how many of the requested types each offers
///
/// Ties are broken by zone name so the result is deterministic.
pub fn rank_by_offering_count(offerings: &[(String, String)]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, az) in offerings {
        *counts.entry(az.as_str()).or_default() += 1;
    }
    let mut azs: Vec<&str> = counts.keys().copied().collect();
    azs.sort_by(|a, b| counts[b].cmp(&counts[a]).then_with(|| a.cmp(b)));
    azs.into_iter().map(String::from).collect()
}

/// Choose the ordered AZ list for the infrastructure stack
pub async fn resolve_availability_zones(
    clients: &CloudClients,
    request: &ZoneRequest,
) -> Result<Vec<String>> {
    let all_zones = clients
        .call("DescribeAvailabilityZones", || {
            clients.compute.describe_availability_zones()
        })
        .await?;

    let typed_zones: Vec<String> = all_zones
        .iter()
        .filter(|z| request.zone_type.is_empty() || z.zone_type == request.zone_type)
        .map(|z| z.name.clone())
        .collect();

    let mut candidates: Vec<String> = if request.capacity_reservation {
        let filter = CapacityReservationFilter {
            instance_types: request.instance_types.clone(),
            reservation_id: request.capacity_reservation_id.clone(),
        };
        let reservations = clients
            .call("DescribeCapacityReservations", || {
                clients.compute.describe_capacity_reservations(&filter)
            })
            .await?;
        let mut seen = BTreeSet::new();
        let azs: Vec<String> = reservations
            .into_iter()
            .filter(|r| r.available_instance_count >= request.node_count)
            .filter(|r| {
                request.availability_zones.is_empty()
                    || request.availability_zones.contains(&r.availability_zone)
            })
            .map(|r| r.availability_zone)
            .filter(|az| seen.insert(az.clone()))
            .collect();
        if azs.is_empty() {
            return Err(Error::invalid_config(format!(
                "no active capacity reservation for {:?} has {} available instances",
                request.instance_types, request.node_count
            )));
        }
        azs
    } else if !request.instance_types.is_empty() {
        let offerings = clients
            .call("DescribeInstanceTypeOfferings", || {
                clients
                    .compute
                    .describe_instance_type_offerings(&request.instance_types)
            })
            .await?;
        let pairs: Vec<(String, String)> = offerings
            .into_iter()
            .filter(|o| {
                request.availability_zones.is_empty()
                    || request.availability_zones.contains(&o.availability_zone)
            })
            .map(|o| (o.instance_type, o.availability_zone))
            .collect();
        let ranked = rank_by_offering_count(&pairs);
        if ranked.is_empty() {
            return Err(Error::invalid_config(format!(
                "no AZs support any of the provided instance types ({:?})",
                request.instance_types
            )));
        }
        ranked
    } else {
        request.availability_zones.clone()
    };

    if !request.zone_type.is_empty() {
        candidates.retain(|az| typed_zones.contains(az));
    }
    let mut selected = apply_hinted_order(candidates, &request.hinted_order);
    selected.truncate(INFRA_AZ_COUNT);

    // Pad from the remaining zones when fewer candidates qualified
    for az in apply_hinted_order(typed_zones, &request.hinted_order) {
        if selected.len() == INFRA_AZ_COUNT {
            break;
        }
        if !selected.contains(&az) {
            info!(az = %az, "Padding infrastructure stack with AZ");
            selected.push(az);
        }
    }

    if selected.len() < INFRA_AZ_COUNT {
        return Err(Error::invalid_config(format!(
            "only {} availability zones of type {:?} available, need {}",
            selected.len(),
            request.zone_type,
            INFRA_AZ_COUNT
        )));
    }
    info!(azs = ?selected, "Resolved availability zones");
    Ok(selected)
}
