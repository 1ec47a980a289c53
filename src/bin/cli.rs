//! PartySync CLI Client
//!
//! Runs party operations directly against a store server, publishing the
//! resulting events like any other node would.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use partysync::bus::EventBus;
use partysync::config::{Config, DurableBackend};
use partysync::coordinator::{Coordinator, LeaveOutcome};
use partysync::durable::{open_durable, DurableStore};
use partysync::model::{Party, PlayerId, PlayerSetting};
use partysync::store::{RemoteStore, SharedStore};
use partysync::{PartyError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// PartySync CLI
#[derive(Parser, Debug)]
#[command(name = "partysync-cli")]
#[command(about = "CLI for PartySync party operations")]
struct Args {
    /// Store server address
    #[arg(short, long, default_value = "127.0.0.1:7480")]
    server: String,

    /// Node identity stamped on published events
    #[arg(long, default_value = "cli")]
    node_id: String,

    /// Invitation lifetime in seconds
    #[arg(long, default_value = "90")]
    invite_ttl: u64,

    /// SQLite file holding player settings
    #[arg(long)]
    settings_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a party led by PLAYER
    Create { player: PlayerId },

    /// Invite INVITEE into LEADER's party
    Invite { leader: PlayerId, invitee: PlayerId },

    /// Accept LEADER's invitation
    Accept { invitee: PlayerId, leader: PlayerId },

    /// Decline LEADER's invitation
    Decline { invitee: PlayerId, leader: PlayerId },

    /// Join LEADER's open party without an invitation
    Join { player: PlayerId, leader: PlayerId },

    /// Leave the current party
    Leave { player: PlayerId },

    /// Remove TARGET from LEADER's party
    Kick { leader: PlayerId, target: PlayerId },

    /// Hand leadership to another member
    Transfer { leader: PlayerId, new_leader: PlayerId },

    /// Disband LEADER's party
    Disband { leader: PlayerId },

    /// Open or close LEADER's party to joins without invitation
    Open {
        leader: PlayerId,
        #[arg(action = clap::ArgAction::Set)]
        open: bool,
    },

    /// Show the party PLAYER is in, and their pending invitations
    Show { player: PlayerId },

    /// Send a chat message to SENDER's party
    Chat {
        sender: PlayerId,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Flip one of PLAYER's settings (needs --settings-db)
    Toggle { player: PlayerId, setting: PlayerSetting },

    /// Show PLAYER's settings (needs --settings-db)
    Settings { player: PlayerId },

    /// Ping the store server
    Ping,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .node_id(args.node_id.as_str())
        .invite_ttl_secs(args.invite_ttl)
        .build();
    config.validate()?;

    let store: Arc<dyn SharedStore> = Arc::new(RemoteStore::connect(
        &args.server,
        Duration::from_millis(config.store_timeout_ms),
    )?);
    let coordinator = Coordinator::new(Arc::clone(&store), &config)
        .with_bus(EventBus::new(Arc::clone(&store)));

    match args.command {
        Commands::Create { player } => print_party(&coordinator.create_party(player)?),
        Commands::Invite { leader, invitee } => {
            let invite = coordinator.invite(leader, invitee)?;
            println!("Invited {} (expires at {} ms)", invite.invitee, invite.expires_at);
        }
        Commands::Accept { invitee, leader } => {
            print_party(&coordinator.accept_invite(invitee, leader)?)
        }
        Commands::Decline { invitee, leader } => {
            coordinator.decline_invite(invitee, leader)?;
            println!("Declined");
        }
        Commands::Join { player, leader } => print_party(&coordinator.join_party(player, leader)?),
        Commands::Leave { player } => print_leave(&coordinator.leave_party(player)?),
        Commands::Kick { leader, target } => print_party(&coordinator.kick(leader, target)?),
        Commands::Transfer { leader, new_leader } => {
            print_party(&coordinator.transfer_leadership(leader, new_leader)?)
        }
        Commands::Disband { leader } => {
            let former = coordinator.disband(leader)?;
            println!("Disbanded party {} ({} members)", former.id, former.size());
        }
        Commands::Open { leader, open } => print_party(&coordinator.set_open(leader, open)?),
        Commands::Show { player } => {
            match coordinator.party_of(player)? {
                Some(party) => print_party(&party),
                None => println!("(not in a party)"),
            }
            for invite in coordinator.invitations_for(player)? {
                println!("invite from {} (expires at {} ms)", invite.leader, invite.expires_at);
            }
        }
        Commands::Chat { sender, text } => {
            let message = coordinator.message_party(sender, &text.join(" "))?;
            println!("Sent to {} members", message.recipients.len());
        }
        Commands::Toggle { player, setting } => {
            let settings = open_settings(args.settings_db)?;
            let enabled = !settings.setting(player, setting)?;
            settings.set_setting(player, setting, enabled)?;
            println!("{} {}", setting, if enabled { "enabled" } else { "disabled" });
        }
        Commands::Settings { player } => {
            let settings = open_settings(args.settings_db)?;
            for setting in PlayerSetting::ALL {
                println!("{} = {}", setting, settings.setting(player, setting)?);
            }
        }
        Commands::Ping => {
            store.ping()?;
            println!("PONG");
        }
    }
    Ok(())
}

fn open_settings(path: Option<PathBuf>) -> Result<Arc<dyn DurableStore>> {
    let path = path.ok_or_else(|| PartyError::Config("--settings-db is required".to_string()))?;
    let config = Config::builder()
        .durable(DurableBackend::Sqlite { path })
        .build();
    open_durable(&config, None)?
        .ok_or_else(|| PartyError::Config("no settings backend".to_string()))
}

fn print_party(party: &Party) {
    println!(
        "party {} rev {} leader {}{}",
        party.id,
        party.revision,
        party.leader,
        if party.open { " (open)" } else { "" }
    );
    for member in &party.members {
        println!("  {}", member);
    }
}

fn print_leave(outcome: &LeaveOutcome) {
    match outcome {
        LeaveOutcome::Left(party) => {
            println!("Left");
            print_party(party);
        }
        LeaveOutcome::LeaderChanged(party) => {
            println!("Left; leadership passed to {}", party.leader);
            print_party(party);
        }
        LeaveOutcome::Disbanded(party) => println!("Left; party {} disbanded", party.id),
    }
}
