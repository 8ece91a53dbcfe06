use std::error::Error;

use oae_push::push::client::{Identity, PushClient};
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let identity = Identity::new(
        "REPLACE_WITH_USER_ID",
        "REPLACE_WITH_TENANT_ALIAS",
        SecretString::new("REPLACE_WITH_SIGNATURE".to_string()),
    );
    let resource_id = "REPLACE_WITH_USER_ID".to_string();
    let token = "REPLACE_WITH_STREAM_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = PushClient::for_host("https://tenant.example")?;
        let session = client.init(Some(identity)).await?;
        println!("connected endpoint={}", client.endpoint());

        let (subscribed, mut activities) =
            session.subscribe_channel(resource_id, "activity", token);
        subscribed.await?;

        while let Some(activity) = activities.recv().await {
            println!(
                "activity_type={} published={}",
                activity.activity_type().unwrap_or("unknown"),
                activity.published().cloned().unwrap_or_default(),
            );
        }

        session.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
