//! Ask the auxiliary model for each kind of writer's-block suggestion.
//!
//! cargo run --example writers_block -- models/tinyllama-q4.gguf llama_cpp

use std::sync::Arc;

use anyhow::Result;
use loom_engine::{
    setup_logging, Character, InMemoryProject, InferenceLibrary, LogConfig, ModelRole, PlotPoint,
    StoryEngine, SuggestionRequest, SuggestionTask,
};

const STORY: &str = "The storm had knocked out the harbour lights. Mira climbed the \
                     lighthouse stairs with a lantern, counting the steps out loud.";

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(LogConfig::default())?;

    let mut args = std::env::args().skip(1);
    let identifier = args.next().unwrap_or_else(|| "gpt2".to_string());
    let library: InferenceLibrary = args.next().as_deref().unwrap_or("transformers").parse()?;

    let project = Arc::new(InMemoryProject::new());
    let mira = project.add_character(Character::new("Mira", "lighthouse keeper"));
    let tomas = project.add_character(Character::new("Tomas", "harbour master, owes Mira money"));
    let storm =
        project.add_plot_point(PlotPoint::new("The Storm", "every light on the coast fails"));

    let engine = StoryEngine::builder()
        .with_narrative_source(project)
        .build()?;
    let spec = engine.spec_for(identifier, library, ModelRole::Auxiliary);
    println!("{}", engine.load_model(spec).await?.message);

    for task in SuggestionTask::ALL {
        let mut request = SuggestionRequest::new(STORY);
        request.selected_character_ids = vec![mira];
        request.selected_plot_point_ids = vec![storm];
        request.options.focus_character_id = Some(mira);
        request.options.dialogue_character_ids = vec![mira, tomas];
        request.options.setting_name = Some("the lighthouse".to_string());

        match engine.suggest(task, request).await {
            Ok(response) => println!("[{task}] {}", response.suggestion),
            Err(e) => eprintln!("[{task}] failed: {e}"),
        }
    }

    engine.unload_all().await;
    Ok(())
}
