// =============================================================================
// add_user — create or update a PushHub user record
// =============================================================================

use clap::Parser;
use impulse_screener::time::now_secs;
use impulse_screener::user_store::UserStore;

#[derive(Parser)]
#[command(about = "Create or update a user in users.json")]
struct Args {
    /// user_id, e.g. u1
    #[arg(long)]
    uid: String,

    /// Telegram chat id (optional)
    #[arg(long)]
    chat_id: Option<String>,

    /// Set the token explicitly instead of generating one
    #[arg(long)]
    token: Option<String>,

    /// Overwrite the user if it already exists
    #[arg(long)]
    overwrite: bool,

    /// Path to the users store file
    #[arg(long, default_value = "users.json")]
    store: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store = UserStore::load(&args.store)?;
    let token = store.create_user(&args.uid, args.chat_id.clone(), args.token, args.overwrite, now_secs())?;

    println!("OK: user created/updated");
    println!("user_id: {}", args.uid);
    println!("token: {token}");
    println!("chat_id: {}", args.chat_id.as_deref().unwrap_or("none"));

    Ok(())
}
