//! Interactive story continuation.
//!
//! cargo run --example continue_story -- gpt2 transformers cpu

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use loom_engine::{
    setup_logging, Character, GenerateRequest, InMemoryProject, InferenceLibrary, LoomConfig,
    ModelRole, StoryEngine,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = LoomConfig::load("loom.toml")?;
    setup_logging(config.logging.to_log_config())?;

    let mut args = std::env::args().skip(1);
    let identifier = args.next().unwrap_or_else(|| "gpt2".to_string());
    let library: InferenceLibrary = args.next().as_deref().unwrap_or("transformers").parse()?;

    let project = Arc::new(InMemoryProject::new());
    let narrator = project.add_character(Character {
        motivations: Some("find out who keeps relighting the lamp".to_string()),
        ..Character::new("Mira", "the last keeper of the north lighthouse")
    });

    let engine = StoryEngine::builder()
        .with_config(config)
        .with_narrative_source(project)
        .build()?;

    let mut spec = engine.spec_for(identifier, library, ModelRole::Primary);
    if let Some(device) = args.next() {
        spec.device = device.parse()?;
    }
    info!(identifier = %spec.identifier, "loading model...");
    let status = engine.load_model(spec).await?;
    println!("{}", status.message);

    let mut story = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim_end();
        if input == "exit" {
            break;
        }
        story.push_str(input);

        let response = engine
            .generate(GenerateRequest {
                story_text: story.clone(),
                selected_character_ids: vec![narrator],
                ..Default::default()
            })
            .await;
        match response {
            Ok(response) => {
                println!("{}", response.generated_text);
                story.push(' ');
                story.push_str(&response.generated_text);
                story.push(' ');
            }
            Err(e) => eprintln!("[{}] {}", e.kind(), e),
        }
    }

    info!("Shutting down...");
    println!("{}", engine.unload_all().await.message);
    Ok(())
}
