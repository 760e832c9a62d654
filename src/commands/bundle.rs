use anyhow::{Context, Result};

use healer::bundles::{all_bundles, get_bundle};

/// Print the named bundle's `HealingPolicy` YAML to stdout, or list every
/// bundle's name and description when `name` is omitted.
pub fn run(name: Option<String>) -> Result<()> {
    let Some(name) = name else {
        for bundle in all_bundles() {
            println!("{:<14} {}", bundle.name, bundle.description);
        }
        return Ok(());
    };

    let bundle = get_bundle(&name)
        .with_context(|| format!("no such bundle: {name} (run `healer bundle` to list available bundles)"))?;

    let manifest = serde_json::json!({
        "apiVersion": "kubeskippy.io/v1alpha1",
        "kind": "HealingPolicy",
        "metadata": { "name": format!("{}-policy", bundle.name) },
        "spec": bundle.spec,
    });
    println!("{}", serde_yaml::to_string(&manifest)?);
    Ok(())
}
