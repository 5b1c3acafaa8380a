use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with errors that surface in background tasks and
/// would otherwise only be logged.
pub type ErrorHook = Arc<dyn Fn(&crate::error::Error) + Send + Sync>;

/// Construction-time configuration for a replicated log instance. The
/// defaults are the tested operating points; deployments normally only set
/// the identity fields and `base_path`/`listen_addr`.
#[derive(Clone)]
pub struct Config {
    /// Base path of the log; segment files live next to it as
    /// `<base>.<term>.<start>[.<prevTerm>]`.
    pub base_path: PathBuf,
    pub group_id: u64,
    pub local_member_id: u64,
    pub group_token_1: u64,
    pub group_token_2: u64,
    pub listen_addr: SocketAddr,
    /// Whether outbound connections request per-command CRCs.
    pub checksums: bool,

    /// Election tick delay, sampled uniformly per tick.
    pub election_tick: Range<u64>,
    /// Missing-data tick delay, follower only.
    pub missing_data_tick: Range<u64>,
    /// Durable-sync tick delay.
    pub sync_tick: Range<u64>,
    /// Ticks a follower waits with a validated leader before considering
    /// a campaign.
    pub election_validation_budget: i32,

    /// Write-stall watchdog period.
    pub watchdog_period: Duration,
    /// Stalled watchdog ticks tolerated before a client socket is closed.
    pub client_stall_ticks: u32,
    /// Stalled watchdog ticks tolerated before a server socket is closed.
    pub server_stall_ticks: u32,
    /// Reconnect backoff bounds for client channels.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,

    /// First-segment length; each following segment in a term doubles up
    /// to `max_segment_len`.
    pub min_segment_len: u64,
    pub max_segment_len: u64,

    /// Relay writes through one peer that fans them out, offloading the
    /// leader's uplink.
    pub proxy_writes: bool,
    /// Bytes relayed through one proxy peer before the leader rotates to
    /// the next.
    pub proxy_rebalance_bytes: u64,

    /// Uncaught-error handler for background tasks; errors are logged
    /// and swallowed either way.
    pub on_background_error: Option<ErrorHook>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_path", &self.base_path)
            .field("group_id", &self.group_id)
            .field("local_member_id", &self.local_member_id)
            .field("listen_addr", &self.listen_addr)
            .field("checksums", &self.checksums)
            .field("proxy_writes", &self.proxy_writes)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("replog"),
            group_id: 0,
            local_member_id: 0,
            group_token_1: 0,
            group_token_2: 0,
            listen_addr: ([127, 0, 0, 1], 0).into(),
            checksums: true,
            election_tick: 200..300,
            missing_data_tick: 400..600,
            sync_tick: 2000..3000,
            election_validation_budget: 3,
            watchdog_period: Duration::from_millis(125),
            client_stall_ticks: 2,
            server_stall_ticks: 50,
            reconnect_min: Duration::from_millis(10),
            reconnect_max: Duration::from_secs(1),
            min_segment_len: 1024 * 1024,
            max_segment_len: 64 * 1024 * 1024,
            proxy_writes: false,
            proxy_rebalance_bytes: 10_000_000,
            on_background_error: None,
        }
    }
}
