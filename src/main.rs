mod commands;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use commands::init::{DB_FILE, DIR_NAME};
use commands::Desk;
use quickdesk::db::Database;

#[derive(Parser)]
#[command(name = "quickdesk")]
#[command(about = "A small helpdesk: tickets, replies and votes")]
#[command(version)]
struct Cli {
    /// Use this .quickdesk directory instead of searching upward
    #[arg(long, global = true, env = "QUICKDESK_DIR")]
    dir: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize quickdesk in the current directory
    Init {
        /// Load an exported JSON snapshot
        #[arg(long)]
        import: Option<PathBuf>,
    },

    /// Sign in by email
    Login {
        email: String,
    },

    /// Sign out
    Logout,

    /// Show the signed-in user
    Whoami,

    /// Open a new ticket
    Create {
        /// Ticket subject
        subject: String,
        /// What is wrong
        #[arg(short, long)]
        description: String,
        /// Category id or name
        #[arg(short, long)]
        category: String,
        /// Priority (low, medium, high, critical)
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Tag (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Attachment name (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },

    /// List tickets
    List {
        /// Filter by status (open, in-progress, resolved, closed)
        #[arg(short, long)]
        status: Option<String>,
        /// Filter by priority
        #[arg(short, long)]
        priority: Option<String>,
        /// Filter by category name
        #[arg(short, long)]
        category: Option<String>,
        /// Filter by assignee: a user id, "me" or "none"
        #[arg(short, long)]
        assigned: Option<String>,
    },

    /// Search subjects, descriptions and ticket ids
    Search {
        text: String,
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long)]
        priority: Option<String>,
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Show a ticket and its replies
    Show {
        id: String,
    },

    /// Edit a ticket
    Update {
        id: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(short, long)]
        priority: Option<String>,
        /// Replace the tags (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Replace the attachments (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },

    /// Move a ticket to another status
    Status {
        id: String,
        /// open, in-progress, resolved or closed
        status: String,
    },

    /// Assign a ticket to an agent
    Assign {
        id: String,
        /// Agent id or email; defaults to yourself
        #[arg(long)]
        to: Option<String>,
        /// Remove the assignee
        #[arg(long, conflicts_with = "to")]
        clear: bool,
    },

    /// Reply to a ticket
    Reply {
        id: String,
        message: String,
        /// Only visible to staff
        #[arg(long)]
        internal: bool,
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },

    /// Vote on a ticket
    Vote {
        id: String,
        /// up or down
        direction: Option<String>,
        /// Take your vote back
        #[arg(long, conflicts_with = "direction")]
        clear: bool,
    },

    /// Delete a ticket with its replies and votes
    Delete {
        id: String,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Ticket counts
    Stats,

    /// Export tickets
    Export {
        /// json (full snapshot, admins only) or markdown
        #[arg(short, long, default_value = "json")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Follow ticket changes from other sessions
    Watch {
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Manage categories
    Category {
        #[command(subcommand)]
        action: CategoryCommands,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
}

#[derive(Subcommand)]
enum CategoryCommands {
    /// Add a category
    Add {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "gray")]
        color: String,
    },
    /// List categories
    List,
    /// Edit a category by id or name
    Update {
        category: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        color: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Deactivate a category
    Delete {
        category: String,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add a user
    Add {
        name: String,
        email: String,
        /// user, agent or admin
        #[arg(short, long, default_value = "user")]
        role: String,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    /// List users
    List {
        #[arg(short, long)]
        role: Option<String>,
    },
    /// Edit a user by id or email. An empty value clears a profile field
    Update {
        user: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
}

/// Logs go to stderr so they never mix with command output.
/// `QUICKDESK_LOG` overrides the level picked by `-v`.
fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_env("QUICKDESK_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn find_quickdesk_dir() -> Result<PathBuf> {
    let mut current = env::current_dir()?;

    loop {
        let candidate = current.join(DIR_NAME);
        if candidate.is_dir() {
            return Ok(candidate);
        }

        if !current.pop() {
            bail!("Not a quickdesk directory (or any parent). Run 'quickdesk init' first.");
        }
    }
}

fn get_db(dir: Option<PathBuf>) -> Result<Database> {
    let quickdesk_dir = match dir {
        Some(dir) => dir,
        None => find_quickdesk_dir()?,
    };
    let db_path = quickdesk_dir.join(DB_FILE);
    if !db_path.exists() {
        bail!("No database at {}. Run 'quickdesk init' first.", db_path.display());
    }
    Database::open(&db_path).context("Failed to open database")
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let command = match cli.command {
        Commands::Init { import } => {
            let cwd = env::current_dir()?;
            commands::init::run(&cwd, import.as_deref())?;
            return Ok(());
        }
        command => command,
    };

    let db = get_db(cli.dir)?;
    let mut desk = commands::open_desk(&db)?;
    let result = dispatch(&mut desk, command);

    // Queued writes live only as long as this process.
    if !desk.pending().is_empty() {
        warn!(
            pending = desk.pending().len(),
            "some changes were not saved to the database; they will be dropped on the next refresh"
        );
    }
    result
}

fn dispatch(desk: &mut Desk, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } => bail!("Already initialized"),

        Commands::Login { email } => commands::session::login(desk, &email),
        Commands::Logout => commands::session::logout(desk),
        Commands::Whoami => commands::session::whoami(desk),

        Commands::Create {
            subject,
            description,
            category,
            priority,
            tags,
            attachments,
        } => commands::create::run(desk, &subject, &description, &category, &priority, &tags, &attachments),

        Commands::List {
            status,
            priority,
            category,
            assigned,
        } => {
            let user = commands::require_user(desk)?;
            let filter = commands::list::build_filter(
                &user,
                status.as_deref(),
                priority.as_deref(),
                category.as_deref(),
                assigned.as_deref(),
            )?;
            commands::list::run(desk, &filter)
        }

        Commands::Search {
            text,
            status,
            priority,
            category,
        } => {
            let user = commands::require_user(desk)?;
            let filter = commands::list::build_filter(
                &user,
                status.as_deref(),
                priority.as_deref(),
                category.as_deref(),
                None,
            )?;
            commands::list::search(desk, &text, &filter).map(|_| ())
        }

        Commands::Show { id } => commands::show::run(desk, &id),

        Commands::Update {
            id,
            subject,
            description,
            category,
            priority,
            tags,
            attachments,
        } => commands::update::run(
            desk,
            &id,
            commands::update::UpdateArgs {
                subject: subject.as_deref(),
                description: description.as_deref(),
                category: category.as_deref(),
                priority: priority.as_deref(),
                tags: non_empty(tags),
                attachments: non_empty(attachments),
            },
        ),

        Commands::Status { id, status } => commands::status::run(desk, &id, &status),

        Commands::Assign { id, to, clear } => commands::assign::run(desk, &id, to.as_deref(), clear),

        Commands::Reply {
            id,
            message,
            internal,
            attachments,
        } => commands::reply::run(desk, &id, &message, internal, &attachments),

        Commands::Vote { id, direction, clear } => commands::vote::run(desk, &id, direction.as_deref(), clear),

        Commands::Delete { id, force } => commands::delete::run(desk, &id, force),

        Commands::Stats => commands::stats::run(desk).map(|_| ()),

        Commands::Export { format, output } => match format.as_str() {
            "json" => commands::export::run_json(desk, output.as_deref()),
            "markdown" | "md" => commands::export::run_markdown(desk, output.as_deref()),
            other => bail!("Unknown format '{}'. Use json or markdown", other),
        },

        Commands::Watch { interval_ms } => {
            let stop = Arc::new(AtomicBool::new(false));
            for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                signal_hook::flag::register(signal, Arc::clone(&stop))
                    .context("Failed to install signal handler")?;
            }
            commands::watch::run(desk, Duration::from_millis(interval_ms), &stop, None).map(|_| ())
        }

        Commands::Category { action } => match action {
            CategoryCommands::Add {
                name,
                description,
                color,
            } => commands::category::add(desk, &name, &description, &color),
            CategoryCommands::List => commands::category::list(desk),
            CategoryCommands::Update {
                category,
                name,
                description,
                color,
                active,
            } => commands::category::update(
                desk,
                &category,
                name.as_deref(),
                description.as_deref(),
                color.as_deref(),
                active,
            ),
            CategoryCommands::Delete { category } => commands::category::delete(desk, &category),
        },

        Commands::User { action } => match action {
            UserCommands::Add {
                name,
                email,
                role,
                department,
                company,
            } => commands::user::add(desk, &name, &email, &role, department.as_deref(), company.as_deref()),
            UserCommands::List { role } => commands::user::list(desk, role.as_deref()),
            UserCommands::Update {
                user,
                name,
                email,
                role,
                status,
                phone,
                location,
                bio,
                company,
                department,
            } => commands::user::update(
                desk,
                &user,
                commands::user::UserArgs {
                    name: name.as_deref(),
                    email: email.as_deref(),
                    role: role.as_deref(),
                    status: status.as_deref(),
                    phone: phone.as_deref(),
                    location: location.as_deref(),
                    bio: bio.as_deref(),
                    company: company.as_deref(),
                    department: department.as_deref(),
                },
            ),
        },
    }
}
