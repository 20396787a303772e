use std::time::Duration;

// ======= Rpc clients =======

/// Per-attempt deadline applied to every outbound RPC call, unless a shorter one is
/// configured for the operation.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(4 * 1000);

/// Deadline for the cheap liveness call made against each endpoint before it is accepted.
pub const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_millis(2 * 1000);

/// Health checks use a shorter deadline than regular calls so a wedged endpoint
/// degrades the health report quickly.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(2 * 1000);

/// How far back `get_transactions` scans when the caller gives no `from_block`.
pub const RECENT_BLOCK_WINDOW: u64 = 128;

// ======= ERC-20 =======

/// topic0 of the ERC-20 `Transfer(address,address,uint256)` event.
pub const ERC20_TRANSFER_TOPIC: &str =
	"0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

// ======= Uniswap V3 =======

/// CREATE2 init code hash of the canonical Uniswap V3 pool.
pub const UNISWAP_V3_POOL_INIT_CODE_HASH: &str =
	"0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54";

/// Mainnet Uniswap V3 factory.
pub const UNISWAP_V3_FACTORY: &str = "0x1F98431c8aD98523631AE4a59f267346ea31F984";

// ======= Settings environment variables =======

/// Prefix for environment overrides, double-underscore separated, e.g.
/// `CS__CACHE__ENVIRONMENT=testnet`.
pub const SETTINGS_ENV_PREFIX: &str = "CS";

pub const ENV_SEPARATOR: &str = "__";
