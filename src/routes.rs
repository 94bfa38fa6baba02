use crate::config::RouteConfig;

/// Commands for the shell sink on a reachability transition. A matching
/// route is always deleted first; the add happens only when bringing the
/// tunnel up, so "down" is pure withdrawal.
pub fn transition_commands(routes: &[RouteConfig], up: bool) -> Vec<String> {
    let mut cmds = Vec::new();
    for r in routes {
        let mut spec = format!("{}/{} via {}", r.to, r.mask, r.gw);
        if let Some(table) = &r.table {
            spec.push_str(&format!(" table {}", table));
        }
        if let Some(metric) = &r.metric {
            spec.push_str(&format!(" metric {}", metric));
        }
        cmds.push(format!("ip route del {}", spec));
        if up {
            cmds.push(format!("ip route add {}", spec));
        }
    }
    cmds
}
