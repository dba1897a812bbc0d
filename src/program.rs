use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Error};
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{info, trace, warn};

use crate::danbooru::config_loader::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::danbooru::{
    dedupe, delete_by_tag, escape_tag_files, sweep, AppConfig, CatalogClient, ConfigManager, Orchestrator,
    RunReport, TagClassifier,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

const PROGRESS_TEMPLATE: &str = "{spinner} {msg:>9} [{bar:40}] {pos}/{len}";

/// Main menu options
#[derive(Debug, Clone, Copy)]
enum MenuOption {
    Download,
    EditSettings,
    DeleteByTag,
    EscapeParentheses,
    ReclassifyTags,
    RemoveDuplicates,
    SweepCorrupted,
    Exit,
}

impl MenuOption {
    fn variants() -> &'static [MenuOption] {
        &[
            MenuOption::Download,
            MenuOption::EditSettings,
            MenuOption::DeleteByTag,
            MenuOption::EscapeParentheses,
            MenuOption::ReclassifyTags,
            MenuOption::RemoveDuplicates,
            MenuOption::SweepCorrupted,
            MenuOption::Exit,
        ]
    }

    fn display_name(&self) -> &'static str {
        match self {
            MenuOption::Download => "Start download",
            MenuOption::EditSettings => "Edit settings",
            MenuOption::DeleteByTag => "Delete images by tag",
            MenuOption::EscapeParentheses => "Escape parentheses in tag files",
            MenuOption::ReclassifyTags => "Reclassify tags (artist prefix, drop copyright/meta)",
            MenuOption::RemoveDuplicates => "Remove duplicate images",
            MenuOption::SweepCorrupted => "Remove corrupted images",
            MenuOption::Exit => "Exit",
        }
    }
}

/// Handles the flow of the downloader user experience.
pub(crate) struct Program {
    config_manager: ConfigManager,
    theme: ColorfulTheme,
}

impl Program {
    pub(crate) fn new(config_manager: ConfigManager) -> Self {
        Self {
            config_manager,
            theme: ColorfulTheme::default(),
        }
    }

    /// Runs the downloader. Without a terminal (or with `run_once`) a single download
    /// run is performed with the saved settings.
    pub(crate) async fn run(&self, run_once: bool) -> Result<(), Error> {
        Term::stdout().set_title("danbooru downloader");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Settings file: {}", self.config_manager.path().display());

        if run_once || !is_interactive_terminal() {
            return self.download().await;
        }

        loop {
            let selection = self.show_menu()?;

            let result = match selection {
                MenuOption::Download => self.download().await,
                MenuOption::EditSettings => self.edit_settings(),
                MenuOption::DeleteByTag => self.delete_by_tag(),
                MenuOption::EscapeParentheses => self.escape_parentheses(),
                MenuOption::ReclassifyTags => self.reclassify_tags().await,
                MenuOption::RemoveDuplicates => self.remove_duplicates().await,
                MenuOption::SweepCorrupted => self.sweep_corrupted().await,
                MenuOption::Exit => {
                    println!("{}", style("Exiting...").cyan());
                    break;
                }
            };

            if let Err(e) = result {
                warn!("{:#}", e);
                println!("{}: {:#}", style("Error").red().bold(), e);
            }
        }

        Ok(())
    }

    fn show_menu(&self) -> Result<MenuOption, Error> {
        let options = MenuOption::variants();
        let option_names: Vec<&str> = options.iter().map(|o| o.display_name()).collect();

        println!("\n{}", style("Danbooru Downloader - Main Menu").cyan().bold());

        let selection = Select::with_theme(&self.theme)
            .items(&option_names)
            .default(0)
            .interact()?;

        Ok(options[selection])
    }

    async fn download(&self) -> Result<(), Error> {
        let config = self.config_manager.snapshot()?;

        if !config.has_credentials() {
            warn!("No API credentials configured, searching anonymously");
        }
        if config.query.tags.is_empty() {
            warn!("No tags configured; every post is a candidate");
        }

        println!(
            "{} {} (limit {}) into {}",
            style("Downloading").cyan().bold(),
            style(config.query.tags.join(" ")).bold(),
            config.query.limit,
            config.paths.save_path
        );

        let progress_bar = progress_bar();
        let orchestrator = Orchestrator::from_config(&config, progress_bar.clone())?;
        let report = orchestrator.run().await;
        progress_bar.finish_and_clear();

        print_report(&report?);
        Ok(())
    }

    fn edit_settings(&self) -> Result<(), Error> {
        let current = self.config_manager.snapshot()?;
        println!("\n{}", style("Edit Settings").cyan().bold());

        let tags: String = Input::with_theme(&self.theme)
            .with_prompt("Tags (space separated)")
            .default(current.query.tags.join(" "))
            .allow_empty(true)
            .interact_text()?;
        let exclude_tags: String = Input::with_theme(&self.theme)
            .with_prompt("Excluded tags (space separated)")
            .default(current.query.exclude_tags.join(" "))
            .allow_empty(true)
            .interact_text()?;
        let score_threshold: i64 = Input::with_theme(&self.theme)
            .with_prompt("Minimum score")
            .default(current.query.score_threshold)
            .interact_text()?;
        let limit: usize = Input::with_theme(&self.theme)
            .with_prompt("Number of images")
            .default(current.query.limit)
            .validate_with(|value: &usize| if *value >= 1 { Ok(()) } else { Err("must be at least 1") })
            .interact_text()?;
        let save_path: String = Input::with_theme(&self.theme)
            .with_prompt("Save folder")
            .default(current.paths.save_path.clone())
            .interact_text()?;
        let concurrency: usize = Input::with_theme(&self.theme)
            .with_prompt(format!("Concurrent downloads ({}-{})", MIN_CONCURRENCY, MAX_CONCURRENCY))
            .default(current.network.concurrency)
            .validate_with(|value: &usize| {
                if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(value) {
                    Ok(())
                } else {
                    Err("out of range")
                }
            })
            .interact_text()?;

        let updated = self.config_manager.update(|config| {
            config.query.tags = split_whitespace(&tags);
            config.query.exclude_tags = split_whitespace(&exclude_tags);
            config.query.score_threshold = score_threshold;
            config.query.limit = limit;
            config.paths.save_path = save_path;
            config.network.concurrency = concurrency;
        })?;

        info!("Settings saved to {}", self.config_manager.path().display());
        println!("{}", style("Settings saved.").green());
        println!("Current tags: {:?}", updated.query.tags);
        Ok(())
    }

    fn delete_by_tag(&self) -> Result<(), Error> {
        let directory = self.ask_directory()?;
        let tag: String = Input::with_theme(&self.theme)
            .with_prompt("Tag to delete")
            .interact_text()?;

        let confirmed = Confirm::with_theme(&self.theme)
            .with_prompt(format!("Delete every image tagged '{}' under {}?", tag, directory.display()))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }

        let deleted = delete_by_tag(&directory, &tag)?;
        println!("{} {} images", style("Deleted").green(), deleted);
        Ok(())
    }

    fn escape_parentheses(&self) -> Result<(), Error> {
        let directory = self.ask_directory()?;
        let changed = escape_tag_files(&directory)?;
        println!("{} {} tag files", style("Updated").green(), changed);
        Ok(())
    }

    async fn reclassify_tags(&self) -> Result<(), Error> {
        let config = self.config_manager.snapshot()?;
        let directory = self.ask_directory()?;

        let client = CatalogClient::from_config(&config)?;
        let classifier = TagClassifier::new(client);
        let processed = classifier.reclassify_dir(&directory).await?;

        println!("{} {} tag files", style("Reclassified").green(), processed);
        Ok(())
    }

    async fn remove_duplicates(&self) -> Result<(), Error> {
        let directory = self.ask_directory()?;
        let report = tokio::task::spawn_blocking(move || dedupe(&directory))
            .await
            .context("Duplicate scan panicked")??;

        println!("{}", style(report).green());
        Ok(())
    }

    async fn sweep_corrupted(&self) -> Result<(), Error> {
        let directory = self.ask_directory()?;
        let deleted = tokio::task::spawn_blocking(move || sweep(&directory))
            .await
            .context("Integrity sweep panicked")??;

        println!("{} {} corrupted images", style("Removed").green(), deleted);
        Ok(())
    }

    /// Folder to operate on, defaulting to the configured save folder.
    fn ask_directory(&self) -> Result<PathBuf, Error> {
        let config: AppConfig = self.config_manager.snapshot()?;
        let directory: String = Input::with_theme(&self.theme)
            .with_prompt("Folder")
            .default(config.paths.save_path)
            .interact_text()?;

        let directory = PathBuf::from(directory);
        if !directory.is_dir() {
            anyhow::bail!("{} is not a folder", directory.display());
        }
        Ok(directory)
    }
}

fn is_interactive_terminal() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn split_whitespace(text: &str) -> Vec<String> {
    text.split_whitespace().map(|tag| tag.to_lowercase()).collect()
}

fn progress_bar() -> ProgressBar {
    let progress_style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");

    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(progress_style);
    progress_bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    progress_bar
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;

    if summary.downloaded == 0 {
        println!("{}", style(&report.message).yellow().bold());
    } else {
        println!("{}", style(&report.message).green().bold());
    }

    for failure in &summary.failures {
        println!(
            "  {} post {} ({} wave): {}",
            style("failed").red(),
            failure.candidate_id,
            failure.wave,
            failure.last_error
        );
    }
}
