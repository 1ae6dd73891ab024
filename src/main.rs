use simulation::simulate_failover;
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CLUSTER SIMULATION                              ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Two clients, light load
    let stats = simulate_failover(2, 50).await?;
    stats.print();

    // Four clients, heavier load
    let stats = simulate_failover(4, 100).await?;
    stats.print();

    if stats.converged {
        println!("\n✓ All replicas converged after failover!");
    } else {
        println!("\n✗ Replicas diverged after failover");
    }
    Ok(())
}
