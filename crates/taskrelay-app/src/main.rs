use taskrelay_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let app = taskrelay_app::initialize_app(config).await?;
    app.run().await?;

    Ok(())
}
