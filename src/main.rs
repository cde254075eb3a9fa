use soak_test::soak_test;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            OFFLINE QUEUE SOAK RUNS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Run 1: reliable remote, connectivity flapping only
    let stats = soak_test(10, 500, 0.0).await;
    stats.print();

    // Run 2: one request in five rejected
    let stats = soak_test(10, 1000, 0.2).await;
    stats.print();

    // Run 3: many records, hostile remote
    let stats = soak_test(100, 2000, 0.5).await;
    stats.print();

    println!("\n✓ All soak runs completed successfully!");
}
