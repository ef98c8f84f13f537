use std::str::FromStr;

fn get_env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    if let Ok(v) = std::env::var(key) {
        if let Ok(v) = v.parse::<T>() {
            return v;
        }
    }
    default
}

lazy_static! {
    /// Timeout for dialing an outbound connection, in seconds.
    pub static ref OUTBOUND_DIAL_TIMEOUT: u64 = get_env_var_or("OUTBOUND_DIAL_TIMEOUT", 4);

    /// Upper bound of a single URL test attempt, dial included, in seconds.
    pub static ref URLTEST_TIMEOUT: u64 = get_env_var_or("URLTEST_TIMEOUT", 15);

    /// Number of members probed at the same time by one group.
    pub static ref URLTEST_CONCURRENCY: usize = get_env_var_or("URLTEST_CONCURRENCY", 10);

    /// Consecutive dial failures through a selected member before the group
    /// drops the selection and re-probes.
    pub static ref URLTEST_MIN_FAILURE_TO_RESET: usize =
        get_env_var_or("URLTEST_MIN_FAILURE_TO_RESET", 5);

    pub static ref RULE_SET_FETCH_CONCURRENCY: usize =
        get_env_var_or("RULE_SET_FETCH_CONCURRENCY", 5);

    /// Rule-set download timeout, in seconds.
    pub static ref RULE_SET_FETCH_TIMEOUT: u64 = get_env_var_or("RULE_SET_FETCH_TIMEOUT", 30);

    /// Timeout of a single DNS exchange, in seconds.
    pub static ref DNS_TIMEOUT: u64 = get_env_var_or("DNS_TIMEOUT", 10);

    pub static ref DNS_CACHE_SIZE: usize = get_env_var_or("DNS_CACHE_SIZE", 4096);

    pub static ref DNS_REVERSE_MAPPING_SIZE: usize =
        get_env_var_or("DNS_REVERSE_MAPPING_SIZE", 1024);

    /// TTL of records synthesized by the local and fake-ip transports, in seconds.
    pub static ref DNS_SYNTHETIC_TTL: u32 = get_env_var_or("DNS_SYNTHETIC_TTL", 600);

    pub static ref FAKE_DNS_CAPACITY: usize = get_env_var_or("FAKE_DNS_CAPACITY", 65535);
}
