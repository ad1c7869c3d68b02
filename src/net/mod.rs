// Kernel-facing networking: devices, firewall rules, liveness probes.
pub mod ensure;
pub mod error;
pub mod iptables;
pub mod link;
pub mod ping;
