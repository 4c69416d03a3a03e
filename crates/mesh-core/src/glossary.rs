//! Token expansion for user-authored announce/timer message templates.

/// Everything a template placeholder might reference. Every field is
/// optional except the always-known ones (`node_count`,
/// `direct_count`, `transport`, `ip`, `port`, `version`, `features`,
/// `time`, `date`), since a token expansion can happen outside the
/// context of any particular observed packet (a pure interval-based
/// announce, say).
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hops: Option<u32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub channel: Option<u32>,
    pub transport: String,
    pub duration: Option<std::time::Duration>,
    pub node_count: usize,
    pub direct_count: usize,
    pub time: String,
    pub date: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
    pub features: String,
}

fn fmt_duration(d: std::time::Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Replace every known `{TOKEN}` placeholder in `template` using
/// `ctx`. Unknown placeholders and tokens with no value in `ctx` are
/// left verbatim — a missing value is not an error, since a template
/// may reference fields that don't apply to every firing (e.g.
/// `{HOPS}` on a non-packet-triggered announce).
pub fn expand(template: &str, ctx: &TokenContext) -> String {
    let mut out = template.to_string();
    let mut replace = |token: &str, value: Option<String>| {
        if let Some(value) = value {
            out = out.replace(token, &value);
        }
    };

    replace("{LONG_NAME}", ctx.long_name.clone());
    replace("{SHORT_NAME}", ctx.short_name.clone());
    replace("{HOPS}", ctx.hops.map(|h| h.to_string()));
    replace("{SNR}", ctx.snr.map(|s| format!("{s:.1}")));
    replace("{RSSI}", ctx.rssi.map(|r| r.to_string()));
    replace("{CHANNEL}", ctx.channel.map(|c| c.to_string()));
    replace("{TRANSPORT}", Some(ctx.transport.clone()));
    replace("{DURATION}", ctx.duration.map(fmt_duration));
    replace("{NODECOUNT}", Some(ctx.node_count.to_string()));
    replace("{DIRECTCOUNT}", Some(ctx.direct_count.to_string()));
    replace("{TIME}", Some(ctx.time.clone()));
    replace("{DATE}", Some(ctx.date.clone()));
    replace("{IP}", Some(ctx.ip.clone()));
    replace("{PORT}", Some(ctx.port.to_string()));
    replace("{VERSION}", Some(ctx.version.clone()));
    replace("{FEATURES}", Some(ctx.features.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_tokens() {
        let ctx = TokenContext {
            long_name: Some("Base Station".into()),
            node_count: 12,
            direct_count: 3,
            transport: "tcp".into(),
            ip: "192.168.1.5".into(),
            port: 4403,
            version: "0.1.0".into(),
            ..Default::default()
        };
        let result = expand("{LONG_NAME} online, {NODECOUNT} nodes ({DIRECTCOUNT} direct) via {TRANSPORT} {IP}:{PORT} v{VERSION}", &ctx);
        assert_eq!(result, "Base Station online, 12 nodes (3 direct) via tcp 192.168.1.5:4403 v0.1.0");
    }

    #[test]
    fn missing_value_leaves_placeholder_untouched() {
        let ctx = TokenContext::default();
        let result = expand("hops={HOPS}", &ctx);
        assert_eq!(result, "hops={HOPS}");
    }

    #[test]
    fn duration_formats_by_magnitude() {
        assert_eq!(fmt_duration(std::time::Duration::from_secs(45)), "45s");
        assert_eq!(fmt_duration(std::time::Duration::from_secs(125)), "2m05s");
        assert_eq!(fmt_duration(std::time::Duration::from_secs(3725)), "1h02m");
    }
}
