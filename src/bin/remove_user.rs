// =============================================================================
// remove_user — delete a PushHub user record
// =============================================================================

use clap::Parser;
use impulse_screener::user_store::UserStore;

#[derive(Parser)]
#[command(about = "Remove a user from users.json")]
struct Args {
    /// user_id to remove
    #[arg(long)]
    uid: String,

    /// Path to the users store file
    #[arg(long, default_value = "users.json")]
    store: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store = UserStore::load(&args.store)?;
    if store.remove_user(&args.uid)? {
        println!("OK: user removed: {}", args.uid);
    } else {
        println!("user not found: {}", args.uid);
    }

    Ok(())
}
