//! Compute service seam: zones, instance types, images, interfaces

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Architecture;

/// An availability zone and its zone type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    pub name: String,
    /// `availability-zone`, `local-zone` or `wavelength-zone`
    pub zone_type: String,
}

/// One (instance type, availability zone) pair the region offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTypeOffering {
    pub instance_type: String,
    pub availability_zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTypeInfo {
    pub instance_type: String,
    pub architectures: Vec<Architecture>,
    pub efa_supported: bool,
    pub maximum_network_cards: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub image_id: String,
    pub name: String,
    pub architecture: Architecture,
}

/// An active on-demand capacity reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityReservation {
    pub id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub available_instance_count: u32,
}

/// Filter applied when listing capacity reservations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityReservationFilter {
    pub instance_types: Vec<String>,
    pub reservation_id: Option<String>,
}

/// Attachment state of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    Available,
    Attaching,
    InUse,
    Detaching,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: String,
    pub status: InterfaceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub availability_zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub image_id: String,
    pub instance_type: String,
    pub launch_time: DateTime<Utc>,
}

/// Compute API surface used by the resolver, node manager and sweeps
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn describe_availability_zones(&self) -> Result<Vec<AvailabilityZone>>;

    /// Offerings for the given instance types, keyed by availability zone
    async fn describe_instance_type_offerings(
        &self,
        instance_types: &[String],
    ) -> Result<Vec<InstanceTypeOffering>>;

    /// Describe a single instance type; `None` means the type is invalid
    async fn describe_instance_type(&self, instance_type: &str)
        -> Result<Option<InstanceTypeInfo>>;

    async fn describe_image(&self, image_id: &str) -> Result<ImageInfo>;

    /// Active reservations matching the filter
    async fn describe_capacity_reservations(
        &self,
        filter: &CapacityReservationFilter,
    ) -> Result<Vec<CapacityReservation>>;

    /// Interfaces of type `interface` in `vpc_id` carrying any of `tag_keys`
    async fn describe_network_interfaces(
        &self,
        vpc_id: &str,
        tag_keys: &[String],
    ) -> Result<Vec<NetworkInterface>>;

    async fn delete_network_interface(&self, interface_id: &str) -> Result<()>;

    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>>;

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<Instance>>;

    /// Ids of running instances whose `Name` tag equals `name`
    async fn find_instances_by_name(&self, name: &str) -> Result<Vec<String>>;
}
