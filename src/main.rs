use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
mod auth;
use sealpost::{
    ContentType, DecryptedPost, FeedEntry, FileBackend, KdfParams, MediaListing, PostDraft,
    PostEdit, Storage, Vault, default_storage,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn is_set(&self) -> bool {
        self.mem_cost_kib.is_some() || self.time_cost.is_some() || self.parallelism.is_some()
    }

    /// Flags given on the command line override `base`.
    fn to_kdf_params(&self, base: KdfParams) -> Result<KdfParams> {
        Ok(KdfParams::new(
            self.mem_cost_kib.unwrap_or(base.mem_cost_kib()),
            self.time_cost.unwrap_or(base.time_cost()),
            self.parallelism.unwrap_or(base.parallelism()),
        )?)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Thought,
    Longform,
}

impl From<Kind> for ContentType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Thought => ContentType::Thought,
            Kind::Longform => ContentType::Longform,
        }
    }
}

fn resolve_storage(path: Option<PathBuf>) -> Result<Storage> {
    match path {
        Some(p) => Ok(Storage::new(p)),
        None => default_storage(),
    }
}

#[derive(Debug, Parser)]
#[command(name = "sealpost")]
#[command(
    version,
    about = "Client-side encrypted micro-blogging vault written in Rust."
)]
struct Cli {
    ///Path to the sealpost vault file
    #[arg(long, global = true, value_name = "PATH", env = "SEALPOST_PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates the vault and its passphrase
    Init {
        #[command(flatten)]
        argon2: Argon2Args,
    },

    /// Writes a new post
    #[command(arg_required_else_help = true)]
    Post {
        content: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "type", value_enum, default_value = "thought")]
        kind: Kind,
        /// Plaintext label, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Publish right away
        #[arg(long, default_value_t = false)]
        public: bool,
    },

    /// Changes an existing post
    #[command(arg_required_else_help = true)]
    Edit {
        id: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long, conflicts_with = "no_title")]
        title: Option<String>,
        /// Removes the title
        #[arg(long, default_value_t = false)]
        no_title: bool,
        #[arg(long = "type", value_enum)]
        kind: Option<Kind>,
        /// Replaces all tags, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Prints one decrypted post
    #[command(arg_required_else_help = true)]
    Show { id: String },

    /// Lists posts, newest first
    Feed {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only posts carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Lists tags with their post counts
    Tags,

    /// Searches decrypted content and titles
    #[command(arg_required_else_help = true)]
    Search { query: String },

    /// Makes a post publicly readable
    #[command(arg_required_else_help = true)]
    Publish { id: String },

    /// Removes the public copy of a post
    #[command(arg_required_else_help = true)]
    Unpublish { id: String },

    /// Deletes a post
    #[command(arg_required_else_help = true)]
    Delete { id: String },

    /// Records a media attachment
    #[command(arg_required_else_help = true)]
    Attach {
        filename: String,
        /// Post to attach the media to
        #[arg(long)]
        post: Option<String>,
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
        /// Size in bytes
        #[arg(long, default_value_t = 0)]
        size: u64,
    },

    /// Lists media attachments
    Media,

    /// Lists public posts; needs no passphrase
    Public,

    /// Writes every post and attachment, decrypted, as JSON
    Export {
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Re-encrypts everything under a new passphrase
    ChangePassphrase {
        #[command(flatten)]
        argon2: Argon2Args,
    },

    /// Shows information about the vault
    Info,
}

fn open(store: Option<PathBuf>) -> Result<Vault<FileBackend>> {
    let storage = resolve_storage(store)?;
    let vault = Vault::new(FileBackend::new(storage));
    let passphrase = auth::read_passphrase()?;
    vault.unlock(&passphrase)?;
    Ok(vault)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SEALPOST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_post(post: &DecryptedPost) {
    println!("id:      {}", post.id);
    if let Some(title) = &post.title {
        println!("title:   {title}");
    }
    println!(
        "type:    {}",
        match post.content_type {
            ContentType::Thought => "thought",
            ContentType::Longform => "longform",
        }
    );
    println!("public:  {}", if post.is_public { "yes" } else { "no" });
    if !post.tags.is_empty() {
        println!("tags:    {}", post.tags.join(", "));
    }
    println!("created: {}", post.created.to_rfc3339());
    println!("updated: {}", post.updated.to_rfc3339());
    println!("words:   {} ({} chars)", post.word_count, post.char_count);
    println!();
    println!("{}", post.content);
}

fn summary(post: &DecryptedPost) -> String {
    let text = post.title.as_deref().unwrap_or(&post.content);
    let line = text.lines().next().unwrap_or_default();
    let mut short: String = line.chars().take(60).collect();
    if short.len() < line.len() {
        short.push('…');
    }
    let marker = if post.is_public { " [public]" } else { "" };
    format!(
        "{}  {}{}  {}",
        post.id,
        post.created.format("%Y-%m-%d %H:%M"),
        marker,
        short
    )
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Cli::parse();
    match args.command {
        Commands::Init { argon2 } => {
            let kdf = argon2.to_kdf_params(KdfParams::default())?;
            let storage = resolve_storage(args.store)?;
            let passphrase =
                auth::read_new_passphrase(&[auth::NEW_PASSPHRASE_ENV, auth::PASSPHRASE_ENV])?;
            Vault::setup(FileBackend::new(storage), &passphrase, kdf)?;
            println!("vault initialized");
        }
        Commands::Post {
            content,
            title,
            kind,
            tags,
            public,
        } => {
            let vault = open(args.store)?;
            let id = vault.create_post(PostDraft {
                content,
                title,
                content_type: kind.into(),
                tags,
                public,
            })?;
            println!("{id}");
        }
        Commands::Edit {
            id,
            content,
            title,
            no_title,
            kind,
            tags,
        } => {
            let vault = open(args.store)?;
            let title = if no_title { Some(None) } else { title.map(Some) };
            vault.edit_post(
                &id,
                PostEdit {
                    content,
                    title,
                    content_type: kind.map(Into::into),
                    tags: (!tags.is_empty()).then_some(tags),
                },
            )?;
            println!("post '{id}' updated");
        }
        Commands::Show { id } => {
            let vault = open(args.store)?;
            print_post(&vault.read_post(&id)?);
        }
        Commands::Feed { offset, limit, tag } => {
            let vault = open(args.store)?;
            let feed = vault.feed(offset, limit, tag.as_deref())?;
            if feed.is_empty() {
                println!("No posts.");
            }
            for entry in feed {
                match entry {
                    FeedEntry::Readable(post) => println!("{}", summary(&post)),
                    FeedEntry::Unreadable { id } => println!("{id}  <failed to decrypt>"),
                }
            }
        }
        Commands::Tags => {
            let storage = resolve_storage(args.store)?;
            let vault = Vault::new(FileBackend::new(storage));
            let tags = vault.tags()?;
            if tags.is_empty() {
                println!("No tags.");
            }
            for tag in tags {
                println!("{}  {}", tag.name, tag.posts);
            }
        }
        Commands::Search { query } => {
            let vault = open(args.store)?;
            let hits = vault.search(&query)?;
            if hits.is_empty() {
                println!("No matching posts.");
            }
            for post in hits {
                println!("{}", summary(&post));
            }
        }
        Commands::Publish { id } => {
            let vault = open(args.store)?;
            vault.set_public(&id, true)?;
            println!("post '{id}' is public");
        }
        Commands::Unpublish { id } => {
            let vault = open(args.store)?;
            vault.set_public(&id, false)?;
            println!("post '{id}' is private");
        }
        Commands::Delete { id } => {
            let vault = open(args.store)?;
            vault.delete_post(&id)?;
            println!("post '{id}' deleted");
        }
        Commands::Attach {
            filename,
            post,
            mime,
            size,
        } => {
            let vault = open(args.store)?;
            let id = vault.attach_media(post.as_deref(), &filename, &mime, size)?;
            println!("{id}");
        }
        Commands::Media => {
            let vault = open(args.store)?;
            let media = vault.media()?;
            if media.is_empty() {
                println!("No media.");
            }
            for entry in media {
                match entry {
                    MediaListing::Readable(m) => println!(
                        "{}  {}  {}  {} bytes  {}",
                        m.id,
                        m.filename,
                        m.mime_type,
                        m.size,
                        m.post_id.as_deref().unwrap_or("-")
                    ),
                    MediaListing::Unreadable { id } => println!("{id}  <failed to decrypt>"),
                }
            }
        }
        Commands::Public => {
            let storage = resolve_storage(args.store)?;
            let vault = Vault::new(FileBackend::new(storage));
            for post in vault.public_posts()? {
                if let Some(title) = &post.title {
                    println!("# {title}");
                }
                println!("{}  {}", post.id, post.created.format("%Y-%m-%d %H:%M"));
                println!("{}", post.content);
                println!();
            }
        }
        Commands::Export { output } => {
            let vault = open(args.store)?;
            let json = serde_json::to_string_pretty(&vault.export()?)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("exported to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::ChangePassphrase { argon2 } => {
            let vault = open(args.store)?;
            let new_passphrase = auth::read_new_passphrase(&[auth::NEW_PASSPHRASE_ENV])?;
            let report = if argon2.is_set() {
                let kdf = argon2.to_kdf_params(vault.info()?.kdf)?;
                vault.change_passphrase_with_kdf(&new_passphrase, kdf)?
            } else {
                vault.change_passphrase(&new_passphrase)?
            };
            println!(
                "passphrase changed; re-encrypted {} posts and {} media",
                report.posts, report.media
            );
        }
        Commands::Info => {
            let vault = open(args.store)?;
            println!("{}", vault.info()?);
        }
    }

    Ok(())
}
