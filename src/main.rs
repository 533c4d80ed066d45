use std::{fs, sync::Arc};

use anyhow::Context;
use quizsync::{
    clock::SystemClock,
    config::Settings,
    engine::{Options, QuizEngine},
    question::QuestionSet,
    runtime::TimerTask,
    server::{AppState, create_app},
    store::{FileStore, MemoryStore, Store},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quizsync=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load().context("failed to load settings")?;
    tracing::info!(
        env = %std::env::var("APP_ENV").unwrap_or_else(|_| "development".into()),
        bind = %settings.bind,
        "settings loaded"
    );

    let store: Arc<dyn Store> = match &settings.data_dir {
        Some(dir) => Arc::new(
            FileStore::open(dir).with_context(|| format!("failed to open {}", dir.display()))?,
        ),
        None => {
            tracing::warn!("no data_dir configured, quiz data is kept in memory");
            Arc::new(MemoryStore::default())
        }
    };

    let engine = Arc::new(QuizEngine::open(
        Options::from(&settings),
        store,
        Arc::new(SystemClock),
    )?);

    if let Some(path) = &settings.questions_file {
        if engine.questions().await.is_empty() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let questions: QuestionSet = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            engine.replace_questions(questions).await?;
        }
    }

    let timer = TimerTask::spawn(Arc::clone(&engine), settings.tick_interval);
    let app = create_app(AppState::new(Arc::clone(&engine), &settings.driver_pin));

    let listener = tokio::net::TcpListener::bind(&settings.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind))?;
    tracing::info!("server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    timer.stop().await;
    Ok(())
}
