//! Resource resolver
//!
//! Chooses availability zones, subnet CIDRs, instance types and machine
//! images that satisfy the run's cross-cutting constraints before any
//! stack is created.

pub mod ami;
pub mod cidr;
pub mod instance_types;
pub mod zones;

pub use ami::{recommended_ami_parameter, resolve_ami};
pub use cidr::{nth_address, parse_cidr, subnet_cidrs};
pub use instance_types::{
    ami_type_architecture, default_instance_types, resolve_instance_types, InstanceTypeRequest,
};
pub use zones::{
    hinted_order_from_env, resolve_availability_zones, ZoneRequest, INFRA_AZ_COUNT,
};
