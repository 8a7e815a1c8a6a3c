mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<(), cli::Error> {
    cli::run().await
}
