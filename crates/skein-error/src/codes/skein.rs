//! Reserved code namespace for this runtime's own subsystems.
//!
//! Other crates in this workspace should not invent codes in the 5000–7999
//! range; add them here so `match_error!` arms stay portable across crates.

use crate::GlobalId;

// ── Systems (5000–5099) ───────────────────────────────────────────

pub const SYS_SKEIN_NET:    GlobalId = GlobalId::new("skein_net", 5001);
pub const SYS_SKEIN_TIMER:  GlobalId = GlobalId::new("skein_timer", 5002);
pub const SYS_SKEIN_WORKER: GlobalId = GlobalId::new("skein_worker", 5003);

// ── Subsystems (5100–5199) ────────────────────────────────────────

pub const SUB_SKEIN_REACTOR:  GlobalId = GlobalId::new("skein_reactor", 5100);
pub const SUB_SKEIN_POOL:     GlobalId = GlobalId::new("skein_pool", 5101);
pub const SUB_SKEIN_WHEEL:    GlobalId = GlobalId::new("skein_wheel", 5102);
pub const SUB_SKEIN_DISPATCH: GlobalId = GlobalId::new("skein_dispatch", 5103);
pub const SUB_SKEIN_MONITOR:  GlobalId = GlobalId::new("skein_monitor", 5104);

// ── Semantic error codes (6000–6099) ──────────────────────────────
//
// These mirror the core's own error taxonomy: system errno is reported
// separately (see `codes::errno`), these are the additional codes layered
// above it.

pub const ERR_SKEIN_ADDRINFO:  GlobalId = GlobalId::new("skein_addrinfo", 6001);
pub const ERR_SKEIN_NO_SOCKET: GlobalId = GlobalId::new("skein_no_socket", 6002);
pub const ERR_SKEIN_CLOSING:   GlobalId = GlobalId::new("skein_closing", 6003);
pub const ERR_SKEIN_CLOSED:    GlobalId = GlobalId::new("skein_closed", 6004);
pub const ERR_SKEIN_EOF:       GlobalId = GlobalId::new("skein_eof", 6005);
pub const ERR_SKEIN_POOL_EXHAUSTED: GlobalId = GlobalId::new("skein_pool_exhausted", 6006);
