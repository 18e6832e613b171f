use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};
use crate::models::{Recipe, RecipeType};

/// Loads and caches validated recipes from `<recipes_dir>/<name>.yaml`.
///
/// Parsing and validation stay distinct failure kinds so callers can tell
/// a missing file from a malformed schema from inconsistent values. A
/// recipe is cached on first successful load for the process lifetime;
/// reloading is idempotent.
pub struct RecipeStore {
    recipes_dir: PathBuf,
    cache: RwLock<HashMap<String, Recipe>>,
}

impl RecipeStore {
    pub fn new(recipes_dir: PathBuf) -> Self {
        Self {
            recipes_dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(&self, name: &str) -> Result<Recipe> {
        if let Some(recipe) = self.cache.read().await.get(name) {
            return Ok(recipe.clone());
        }

        let path = self.recipes_dir.join(format!("{name}.yaml"));
        if !path.exists() {
            return Err(OrchestratorError::RecipeNotFound(name.to_string()));
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let recipe: Recipe = serde_yaml::from_str(&contents)
            .map_err(|e| OrchestratorError::RecipeParse(format!("recipe '{name}': {e}")))?;
        recipe.validate()?;

        self.cache
            .write()
            .await
            .insert(name.to_string(), recipe.clone());
        Ok(recipe)
    }

    /// Names of all recipes in the directory, optionally filtered by type.
    /// Files that fail to parse or validate are skipped with a warning.
    pub async fn list_available(&self, filter: Option<RecipeType>) -> Result<Vec<String>> {
        if !self.recipes_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.recipes_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(stem).await {
                Ok(recipe) => {
                    if filter.is_none() || filter == Some(recipe.recipe_type()) {
                        names.push(stem.to_string());
                    }
                }
                Err(e) => {
                    tracing::warn!(recipe = stem, "skipping unloadable recipe: {e}");
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SERVER_YAML: &str = r#"
type: server
name: vllm-inference
version: "1.0"
resources:
  cpus: 8
  gpus: 1
  memory_gb: 64
container:
  image: docker://vllm/vllm-openai:latest
  command: ["--model", "mistral-7b"]
  gpu: true
ports:
  - name: api
    container_port: 8000
health_check:
  path: /health
  port: api
  interval_secs: 5
  failure_threshold: 3
"#;

    const CLIENT_YAML: &str = r#"
type: client
name: llm-stress-test
version: "1.0"
container:
  image: docker://ghcr.io/ubench/stress:latest
results_path: results/stress.json
"#;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, RecipeStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, yaml) in files {
            fs::write(dir.path().join(format!("{name}.yaml")), yaml).unwrap();
        }
        let store = RecipeStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn load_parses_and_validates() {
        let (_dir, store) = store_with(&[("vllm-inference", SERVER_YAML)]);
        let recipe = store.load("vllm-inference").await.unwrap();
        assert_eq!(recipe.name(), "vllm-inference");
        assert_eq!(recipe.recipe_type(), RecipeType::Server);
        assert_eq!(recipe.resources().gpus, 1);
    }

    #[tokio::test]
    async fn load_twice_is_value_equal() {
        let (_dir, store) = store_with(&[("vllm-inference", SERVER_YAML)]);
        let first = store.load("vllm-inference").await.unwrap();
        let second = store.load("vllm-inference").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_recipe_is_not_found() {
        let (_dir, store) = store_with(&[]);
        assert!(matches!(
            store.load("nope").await,
            Err(OrchestratorError::RecipeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_yaml_is_a_parse_error() {
        let (_dir, store) = store_with(&[("broken", "type: server\nname: [unclosed")]);
        assert!(matches!(
            store.load("broken").await,
            Err(OrchestratorError::RecipeParse(_))
        ));
    }

    #[tokio::test]
    async fn inconsistent_values_are_a_validation_error() {
        let yaml = SERVER_YAML.replace("gpus: 1", "gpus: -1");
        let (_dir, store) = store_with(&[("bad", &yaml)]);
        assert!(matches!(
            store.load("bad").await,
            Err(OrchestratorError::RecipeValidation(_))
        ));
    }

    #[tokio::test]
    async fn list_available_filters_by_type() {
        let (_dir, store) = store_with(&[
            ("vllm-inference", SERVER_YAML),
            ("llm-stress-test", CLIENT_YAML),
            ("broken", "not: [valid"),
        ]);
        let all = store.list_available(None).await.unwrap();
        assert_eq!(all, vec!["llm-stress-test", "vllm-inference"]);
        let servers = store.list_available(Some(RecipeType::Server)).await.unwrap();
        assert_eq!(servers, vec!["vllm-inference"]);
        let clients = store.list_available(Some(RecipeType::Client)).await.unwrap();
        assert_eq!(clients, vec!["llm-stress-test"]);
    }
}
