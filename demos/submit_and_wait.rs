use anyhow::Result;
use maap::{Client, JobSpec};

fn main() -> Result<()> {
    // Example program that calls the library API.
    // Configure authentication via env vars or a `.maaprc` file.
    let client = Client::from_env()?;

    let spec = JobSpec::new("gedi-subset", "main")
        .input("aoi", "https://maap-ops-workspace.s3.amazonaws.com/shared/aoi/lope.geojson")
        .input("columns", "rh50,rh98,quality_flag")
        .queue("maap-dps-worker-8gb");

    let mut job = client.submit_job(&spec);
    if job.failed() {
        anyhow::bail!("submission rejected: {:?}", job.error_details);
    }
    println!("submitted job {}", job.id);

    client.wait_for_completion(&mut job)?;
    client.refresh_attributes(&mut job)?;

    println!("finished as {}", job.status);
    if let Some(seconds) = job.metrics.job_duration_seconds {
        println!("ran for {seconds}s");
    }
    for output in &job.outputs {
        println!("  {output}");
    }
    Ok(())
}
