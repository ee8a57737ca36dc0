//! Subnet CIDR math

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Address block the infrastructure VPC is carved from
pub const VPC_CIDR: (Ipv4Addr, u8) = (Ipv4Addr::new(192, 168, 0, 0), 16);

/// Largest subnet count a /16 can be split into while keeping /24s
pub const MAX_SUBNETS: usize = 256;

/// Split the VPC block into `n` equally sized subnets
///
/// The prefix length is `16 + ceil(log2 n)`, so three subnets get /18s
/// and the fourth /18 is left unused.
pub fn subnet_cidrs(n: usize) -> Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    if n > MAX_SUBNETS {
        return Err(Error::invalid_config(format!(
            "cannot split {}/{} into {} subnets (max {})",
            VPC_CIDR.0, VPC_CIDR.1, n, MAX_SUBNETS
        )));
    }
    let extra_bits = n.next_power_of_two().trailing_zeros();
    let prefix = VPC_CIDR.1 as u32 + extra_bits;
    let base = u32::from(VPC_CIDR.0);
    let block = 1u32 << (32 - prefix);

    Ok((0..n as u32)
        .map(|i| format!("{}/{}", Ipv4Addr::from(base + i * block), prefix))
        .collect())
}

/// Parse `addr/prefix` into its network address and prefix length
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::invalid_config(format!("invalid CIDR: {}", cidr)))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| Error::invalid_config(format!("invalid CIDR address: {}", cidr)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::invalid_config(format!("invalid CIDR prefix: {}", cidr)))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(Error::invalid_config(format!("invalid CIDR prefix: {}", cidr)));
    }
    Ok((network_address(addr, prefix), prefix))
}

fn network_address(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// Address `offset` hosts into the network of `cidr`
pub fn nth_address(cidr: &str, offset: u32) -> Result<IpAddr> {
    let (network, _) = parse_cidr(cidr)?;
    Ok(match network {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) + offset)),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) + offset as u128)),
    })
}
