fn main() -> anyhow::Result<()> {
    orchestrator_cli::run()
}
