use financial_assistant::{
    agent::FinancialAgent,
    config::Config,
    gemini::GeminiClient,
    interpreter::QueryInterpreter,
    models::ChatMessage,
    store::TransactionStore,
    tools::create_registry,
};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    dotenv::dotenv().ok();

    let config = Config::from_env();
    if config.gemini_api_key.is_empty() {
        eprintln!("GEMINI_API_KEY not set in .env; see .env.example");
    }

    let store = Arc::new(TransactionStore::from_config(config.database_url.as_deref()));
    let llm = Arc::new(GeminiClient::new(config.gemini_api_key.clone()));
    let interpreter = Arc::new(QueryInterpreter::new(
        config.query_strategy,
        Some(llm.clone()),
    ));
    let registry = create_registry(store.clone(), interpreter, llm.clone());
    let agent = FinancialAgent::new(llm, registry);

    println!("Financial assistant ready. Type a message, or 'quit' to exit.");

    let stdin = io::stdin();
    let mut history: Vec<ChatMessage> = Vec::new();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message.eq_ignore_ascii_case("quit") || message.eq_ignore_ascii_case("exit") {
            break;
        }

        match agent.chat(message, &history).await {
            Ok(reply) => {
                println!("{}", reply);
                history.push(ChatMessage {
                    role: "user".to_string(),
                    content: message.to_string(),
                });
                history.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: reply,
                });
            }
            Err(error) => eprintln!("Error processing your request: {}", error),
        }
    }

    Ok(())
}
