use anyhow::Result;
use maap::{Client, SearchQuery};
use std::path::Path;

fn main() -> Result<()> {
    // Example program that calls the library API.
    // Configure authentication via env vars or a `.maaprc` file.
    let client = Client::from_env()?;

    let query = SearchQuery::new()
        .param("short_name", "GEDI02_A")
        .param("bounding_box", "9.31,0.53,9.32,0.54");
    let granules = client.search_granules(&query, 3)?;

    for granule in &granules {
        println!("{}", granule.description());
        if let Some(path) = client.download_granule(granule, Path::new("data"), false)? {
            println!("  saved to {}", path.display());
        }
    }
    Ok(())
}
