#[tokio::main]
async fn main() {
    history::run(std::env::args()).await;
}
