use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rank_kernel_api::{ListPostsRequest, RankingApi, VoteRequest};
use rank_kernel_core::OrderKey;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Rank kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./rank_kernel.sqlite3")]
    db: PathBuf,

    /// Node id embedded in allocated post ids.
    #[arg(long, default_value_t = 1)]
    machine_id: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Post {
        #[command(subcommand)]
        command: PostCommand,
    },
    Vote {
        #[command(subcommand)]
        command: VoteCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum PostCommand {
    Create(PostCreateArgs),
    List(PostListArgs),
    Votes(PostIdArg),
    Score(PostIdArg),
}

#[derive(Debug, Args)]
struct PostCreateArgs {
    #[arg(long)]
    group: u64,
}

#[derive(Debug, Args)]
struct PostListArgs {
    /// Omit (or pass 0) for the global ranking.
    #[arg(long)]
    group: Option<u64>,
    #[arg(long, value_enum, default_value_t = OrderArg::Time)]
    order: OrderArg,
    #[arg(long, default_value_t = 1)]
    page: u64,
    #[arg(long, default_value_t = 10)]
    size: u64,
}

#[derive(Debug, Args)]
struct PostIdArg {
    #[arg(long)]
    post: u64,
}

#[derive(Debug, Subcommand)]
enum VoteCommand {
    Cast(VoteCastArgs),
    Status(VoteStatusArgs),
    Counts(VoteCountsArgs),
}

#[derive(Debug, Args)]
struct VoteCastArgs {
    #[arg(long)]
    user: u64,
    #[arg(long)]
    post: u64,
    /// 1 upvote, 0 cancel, -1 downvote.
    #[arg(long, allow_hyphen_values = true)]
    direction: i8,
}

#[derive(Debug, Args)]
struct VoteStatusArgs {
    #[arg(long)]
    user: u64,
    #[arg(long = "post", required = true)]
    posts: Vec<u64>,
}

#[derive(Debug, Args)]
struct VoteCountsArgs {
    #[arg(long = "post", required = true)]
    posts: Vec<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Time,
    Score,
}

impl From<OrderArg> for OrderKey {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Time => OrderKey::Time,
            OrderArg::Score => OrderKey::Score,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = RankingApi::new(cli.db, cli.machine_id)?;
    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Post { command } => run_post(&command, &api),
        Command::Vote { command } => run_vote(&command, &api),
    }
}

fn run_db(command: &DbCommand, api: &RankingApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_post(command: &PostCommand, api: &RankingApi) -> Result<()> {
    match command {
        PostCommand::Create(args) => {
            let created = api.create_post(args.group)?;
            emit_json(serde_json::to_value(created)?)
        }
        PostCommand::List(args) => {
            let ids = api.list_posts(&ListPostsRequest {
                group_id: args.group,
                order: args.order.into(),
                page: args.page,
                size: args.size,
            })?;
            emit_json(serde_json::json!({ "post_ids": ids }))
        }
        PostCommand::Votes(args) => {
            let votes = api.post_votes(args.post)?;
            emit_json(serde_json::to_value(votes)?)
        }
        PostCommand::Score(args) => {
            let score = api.post_score(args.post)?;
            emit_json(serde_json::to_value(score)?)
        }
    }
}

fn run_vote(command: &VoteCommand, api: &RankingApi) -> Result<()> {
    match command {
        VoteCommand::Cast(args) => {
            api.cast_vote(&VoteRequest {
                user_id: args.user,
                post_id: args.post,
                direction: args.direction,
            })?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "post_id": args.post,
                "direction": args.direction,
            }))
        }
        VoteCommand::Status(args) => {
            let statuses = api.vote_status_batch(args.user, &args.posts)?;
            emit_json(serde_json::json!({ "statuses": statuses }))
        }
        VoteCommand::Counts(args) => {
            let counts = api.post_votes_batch(&args.posts)?;
            emit_json(serde_json::json!({ "post_ids": args.posts, "upvotes": counts }))
        }
    }
}
