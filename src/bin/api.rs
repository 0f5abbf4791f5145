use financial_assistant::{
    agent::FinancialAgent,
    api::{start_server, ApiState},
    auth::TokenVerifier,
    config::Config,
    gemini::GeminiClient,
    interpreter::QueryInterpreter,
    store::TransactionStore,
    tools::create_registry,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = Config::from_env();
    if config.gemini_api_key.is_empty() {
        eprintln!("GEMINI_API_KEY not set; chat requests will fail until it is configured");
    }

    info!("Financial Assistant - API Server");
    info!("Port: {}", config.port);

    // Create components
    let store = Arc::new(TransactionStore::from_config(config.database_url.as_deref()));
    let llm = Arc::new(GeminiClient::new(config.gemini_api_key.clone()));
    let interpreter = Arc::new(QueryInterpreter::new(
        config.query_strategy,
        Some(llm.clone()),
    ));
    let registry = create_registry(store.clone(), interpreter, llm.clone());
    let agent = Arc::new(FinancialAgent::new(llm, registry));
    let verifier = config
        .auth
        .clone()
        .map(|auth| Arc::new(TokenVerifier::new(auth)));

    info!("Agent initialized");
    info!("Starting API server...");

    let state = ApiState {
        agent,
        store,
        verifier,
    };

    start_server(state, config.port).await?;

    Ok(())
}
