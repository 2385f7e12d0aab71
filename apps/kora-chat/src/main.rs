use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = kora_chat::Args::parse();

	kora_chat::run(args).await
}
