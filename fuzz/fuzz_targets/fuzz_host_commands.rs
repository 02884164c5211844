#![no_main]
use blocklock::host::Host;
use blocklock::models::ClientId;
use blocklock::timer::ManualTimers;
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

// Each line is "<client> <command...>", "tick <ms>" or "quit <client>".
fuzz_target!(|data: &[u8]| {
    let Ok(script) = std::str::from_utf8(data) else {
        return;
    };
    let mut host = Host::new(ManualTimers::new());
    for line in script.lines().take(256) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("tick"), Some(ms)) => {
                if let Ok(ms) = ms.parse::<u16>() {
                    host.advance(Duration::from_millis(ms as u64));
                }
            }
            (Some("quit"), Some(id)) => {
                if let Ok(id) = id.parse::<u8>() {
                    host.handle_disconnect(ClientId(id as u64));
                }
            }
            (Some(id), Some(cmd)) => {
                if let Ok(id) = id.parse::<u8>() {
                    let client = ClientId(id as u64);
                    if host.is_blocked(client) {
                        continue;
                    }
                    let mut args = vec![cmd.to_string()];
                    args.extend(parts.map(str::to_string));
                    host.handle_command(client, &args);
                }
            }
            _ => {}
        }
        for (client, _) in host.drain_unblocked() {
            assert!(!host.is_blocked(client));
        }
    }
});
