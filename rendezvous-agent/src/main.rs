use std::process;

#[tokio::main]
async fn main() {
    if let Err(e) = rendezvous_agent::run().await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
