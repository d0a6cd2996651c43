use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "hydronet-core",
    version,
    about = "Water-network analytics processing service"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
