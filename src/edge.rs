/// Seconds until the next refresh boundary after `now_ms`, plus `grace_ms`.
///
/// The boundary is the first multiple of `refresh_interval_ms` strictly
/// greater than `now_ms`. Never returns less than one second.
pub fn aligned_ttl_seconds(now_ms: i64, refresh_interval_ms: i64, grace_ms: i64) -> u64 {
    let grace_ms = grace_ms.max(0);
    if refresh_interval_ms <= 0 {
        return (grace_ms / 1000).max(1) as u64;
    }

    let boundary = next_boundary(now_ms, refresh_interval_ms);
    let ttl_ms = boundary - now_ms + grace_ms;
    (ttl_ms / 1000).max(1) as u64
}

pub fn next_boundary(now_ms: i64, refresh_interval_ms: i64) -> i64 {
    (now_ms.div_euclid(refresh_interval_ms) + 1) * refresh_interval_ms
}

/// `Cache-Control` value for responses regenerated every `refresh_interval_ms`.
pub fn cache_control(now_ms: i64, refresh_interval_ms: i64, grace_ms: i64) -> String {
    let ttl = aligned_ttl_seconds(now_ms, refresh_interval_ms, grace_ms);
    format!("public, max-age={ttl}, s-maxage={ttl}")
}
