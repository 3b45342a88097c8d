#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trip_geocoder::run().await
}
