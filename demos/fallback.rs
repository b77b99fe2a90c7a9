//! Capability degradation walkthrough: broadcast, storage fallback, no-op.
//!
//! Run with: cargo run --example fallback

use tabsync::{ChannelOptions, Context, Host};

fn show(label: &str, host: &Host) {
    let tab_a = Context::attach(host);
    let tab_b = Context::attach(host);

    let a = tab_a.channel("status", String::from("-"), ChannelOptions::new());
    let b = tab_b.channel("status", String::from("-"), ChannelOptions::new());

    a.set(format!("hello from {label}"));
    println!(
        "{label:>20}: transport {:?}, peer sees '{}'",
        a.transport_kind(),
        b.get()
    );
}

fn main() {
    show("full capabilities", &Host::new());
    show("no broadcast", &Host::builder().broadcast(false).build());
    show("broken broadcast", &Host::builder().bus_open_limit(0).build());
    show("detached", &Host::detached());
}
