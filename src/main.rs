//! Demo: run a churning ring twice with the same seed and verify the
//! two runs are identical, then print the final snapshot.

use toroid::{
    ChurnAction, ChurnEvent, RingSnapshot, RoutingMode, SimConfig, VirtualTime,
};

fn run_once(cfg: &SimConfig, horizon: u64) -> RingSnapshot {
    let (mut sim, mut ring, ids) = cfg.build();
    sim.run_until(&mut ring, VirtualTime::new(horizon));

    println!(
        "  ring of {} nodes (first: {}), {} events, {} trace lines",
        ring.alive_ids().len(),
        ids.first().map(|i| i.to_string()).unwrap_or_default(),
        sim.events_processed(),
        ring.trace().len()
    );
    for c in ring.completions() {
        match &c.result {
            Ok(outcome) => println!(
                "  {} op#{} {:?} {:?} -> {:?} ({} hops)",
                c.finished_at, c.op, c.kind, c.key, outcome, c.hops
            ),
            Err(e) => println!(
                "  {} op#{} {:?} {:?} -> error: {e}",
                c.finished_at, c.op, c.kind, c.key
            ),
        }
    }
    ring.snapshot(sim.now())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let seed = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(42u64);

    let cfg = SimConfig {
        node_count: 8,
        random_seed: seed,
        protocol: toroid::ProtocolConfig {
            routing_mode: RoutingMode::Advanced,
            ..Default::default()
        },
        churn: vec![
            ChurnEvent {
                at: 150,
                action: ChurnAction::Put {
                    key: "user:42".into(),
                    value: "arrakis".into(),
                },
            },
            ChurnEvent {
                at: 200,
                action: ChurnAction::Join,
            },
            ChurnEvent {
                at: 300,
                action: ChurnAction::Get {
                    key: "user:42".into(),
                },
            },
            ChurnEvent {
                at: 400,
                action: ChurnAction::Delete {
                    key: "user:42".into(),
                },
            },
        ],
        ..SimConfig::default()
    };

    println!("toroid demo, seed {seed}");
    println!("first run:");
    let first = run_once(&cfg, 600);
    println!("second run:");
    let second = run_once(&cfg, 600);

    if first == second {
        println!("replay check: OK — identical snapshot and trace");
    } else {
        println!("replay check: FAILED — runs diverged");
        std::process::exit(1);
    }

    match first.to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("snapshot export failed: {e}"),
    }
}
