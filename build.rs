//! Build script: generates the man page and shell completions from the CLI
//! definition. `src/cli.rs` is self-contained (clap + std only) so it can be
//! included here without pulling in the rest of the crate.

include!("src/cli.rs");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    use clap::CommandFactory;
    use clap_complete::{generate_to, shells};

    println!("cargo:rerun-if-changed=src/cli.rs");

    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);
    let mut cmd = Cli::command();

    let man = clap_mangen::Man::new(cmd.clone());
    let mut buffer: Vec<u8> = Vec::new();
    man.render(&mut buffer)?;
    std::fs::write(out_dir.join("gradestack.1"), buffer)?;

    for shell in [shells::Shell::Bash, shells::Shell::Zsh, shells::Shell::Fish] {
        generate_to(shell, &mut cmd, "gradestack", &out_dir)?;
    }

    Ok(())
}
