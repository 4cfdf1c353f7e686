use anyhow::Result;

fn main() -> Result<()> {
    evalbox::cli::run()
}
