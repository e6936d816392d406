//! DNS side of keyphy: the sinkholing server, the host resolver integration
//! that points the system at it, and the shell glue for both. `server` does
//! the wire work, `integrator` owns the redirect/repair/restore cycle, and
//! `system` plus `parse` cover the host tools.

mod integrator;
mod parse;
mod server;
mod system;

pub use integrator::{
    DnsSystemIntegrator, EmergencyRestoreGuard, RedirectMethod, ResolverBackend, LOCAL_RESOLVER,
};
pub use server::{Blocklist, DnsBlockingServer, SINKHOLE_TTL};
pub use system::{
    SystemResolver, DEFAULT_IP_PATHS, DEFAULT_NMCLI_PATHS, DEFAULT_RESOLVECTL_PATHS,
    DEFAULT_SYSTEMCTL_PATHS,
};
