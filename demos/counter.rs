//! Two "tabs" sharing a counter over one host.
//!
//! Run with: cargo run --example counter

use tabsync::{Bindings, ChannelOptions, Context, Host};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tabsync=debug")),
        )
        .init();

    let host = Host::new();
    let tab_a = Context::attach(&host);
    let tab_b = Context::attach(&host);

    println!("tab A identity: {}", tab_a.identity());
    println!("tab B identity: {}", tab_b.identity());

    let counter_a = Bindings::new(&tab_a)
        .bind("counter", 0i64, ChannelOptions::new().persist(true))
        .expect("fresh key");
    let counter_b = Bindings::new(&tab_b)
        .bind("counter", 0i64, ChannelOptions::new().persist(true))
        .expect("fresh key");

    let _watch = counter_b.on_change(|n| println!("tab B observed counter = {n}"));

    counter_a.update(|n| n + 1);
    counter_a.update(|n| n + 1);
    counter_a.update(|n| n + 1);

    println!("tab A reads {}", counter_a.get());
    println!("tab B reads {}", counter_b.get());

    // Reload tab A: persistence seeds the new channel with the last value.
    let reloaded = tab_a.reload();
    let revived = reloaded.channel("counter", 0i64, ChannelOptions::new().persist(true));
    println!("tab A after reload reads {}", revived.get());
}
