use clap::{ArgAction, Parser, Subcommand, ValueHint};

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    help_template = "{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}",
    arg_required_else_help = true
)]
pub struct Args {
    /// Set output verbosity
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress outputs
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output as json
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Disable colors in output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Provide custom config file
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<String>,

    /// Set proxy for uplink requests
    #[arg(required = false, long, short = 'P', global = true)]
    pub proxy: Option<String>,

    /// Set user agent for uplink requests
    #[arg(required = false, long, short = 'A', global = true)]
    pub user_agent: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the configuration file to stdout
    Config,

    /// Generate default config
    #[clap(name = "defconfig")]
    DefConfig,

    /// Show a package document, refreshed from uplinks
    #[command(arg_required_else_help = true)]
    #[clap(name = "info", visible_alias = "view")]
    Info {
        /// Package name
        name: String,

        /// Answer from local storage only
        #[arg(required = false, long)]
        offline: bool,

        /// Keep uplink freshness stamps in the document
        #[arg(required = false, long)]
        keep_uplinks: bool,

        /// Print the whole document
        #[arg(required = false, long)]
        raw: bool,
    },

    /// Download a tarball, through the local cache
    #[command(arg_required_else_help = true)]
    #[clap(name = "fetch", visible_alias = "dl")]
    Fetch {
        /// Package name
        name: String,

        /// Tarball file name, e.g. `left-pad-1.3.0.tgz`
        filename: String,

        /// Output path (defaults to the tarball file name)
        #[arg(required = false, short, long, value_hint = ValueHint::FilePath)]
        output: Option<String>,
    },

    /// Search uplinks and local packages
    #[clap(name = "search", visible_alias = "s")]
    Search {
        /// Text to look for in names, descriptions and keywords
        query: Option<String>,

        /// Only packages modified after this epoch timestamp (milliseconds)
        #[arg(required = false, long)]
        since: Option<u64>,

        /// Search local packages only
        #[arg(required = false, long)]
        local: bool,

        /// Stop after this many results
        #[arg(required = false, long)]
        limit: Option<usize>,
    },

    /// List locally published packages
    #[clap(name = "local", visible_alias = "ls")]
    Local,

    /// Publish a package document, optionally with its tarball
    #[command(arg_required_else_help = true)]
    Publish {
        /// Package document (JSON)
        #[arg(value_hint = ValueHint::FilePath)]
        manifest: String,

        /// Tarball to upload with the document
        #[arg(required = false, short, long, value_hint = ValueHint::FilePath)]
        tarball: Option<String>,
    },

    /// Point a dist-tag at a version, or remove it
    #[command(arg_required_else_help = true)]
    Tag {
        /// Package name
        name: String,

        /// Tag name
        tag: String,

        /// Version to tag; the tag is removed when omitted
        version: Option<String>,
    },

    /// Remove a single version of a local package
    #[command(arg_required_else_help = true)]
    Unpublish {
        /// Package name
        name: String,

        /// Version to remove
        version: String,
    },

    /// Remove a local package with all its tarballs
    #[command(arg_required_else_help = true)]
    #[clap(name = "remove", visible_alias = "rm")]
    Remove {
        /// Package name
        name: String,
    },
}
