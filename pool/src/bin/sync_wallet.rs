use clap::Parser;
use std::path::PathBuf;
use sync_pool::wallet;

#[derive(Parser, Debug)]
#[command(
    name = "sync-wallet",
    about = "Create a SYNC address for a mining device and save it to the local wallet",
    long_about = None
)]
struct Cli {
    /// Device label, e.g. Bitaxe001
    #[arg(default_value = wallet::DEFAULT_DEVICE)]
    device: String,

    /// Network name (testnet addresses start with tsync1q)
    #[arg(short, long, default_value = wallet::DEFAULT_NETWORK)]
    network: String,

    /// Wallet directory (defaults to ~/.sync-testnet)
    #[arg(long)]
    dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let dir = match cli.dir {
        Some(dir) => dir,
        None => wallet::default_wallet_dir()?,
    };

    let address = wallet::generate_address(&cli.device, &cli.network);
    let wallet_file = wallet::persist_address(&dir, &cli.device, &address)?;

    println!("Address created: {}", address);
    println!("Device: {}", cli.device);
    println!("Saved to: {}", wallet_file.display());
    Ok(())
}
