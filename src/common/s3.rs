//! Helper code for working with S3.

/// Helper that returns whether S3 mode has been enabled via `AWS_ACCESS_KEY_ID`.
pub fn s3_mode() -> bool {
    std::env::var("AWS_ACCESS_KEY_ID").is_ok()
}

/// Return the S3 configuration from environment variables.
pub async fn config_from_env() -> Result<aws_sdk_s3::config::Config, anyhow::Error> {
    let config = aws_config::from_env().load().await;
    let endpoint_url = std::env::var("AWS_ENDPOINT_URL").map_err(|e| {
        anyhow::anyhow!(
            "Could not get endpoint url from env AWS_ENDPOINT_URL: {}",
            e
        )
    })?;
    tracing::trace!("will use endpoint url {:?}", &endpoint_url);
    Ok(aws_sdk_s3::config::Builder::from(&config)
        .endpoint_url(endpoint_url)
        .force_path_style(true)
        .build())
}

/// Upload `body` to `bucket` under `key`.
pub async fn put_bytes(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    body: Vec<u8>,
) -> Result<(), anyhow::Error> {
    tracing::debug!("will upload to bucket {:?} and key {:?}", bucket, key);
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(aws_sdk_s3::primitives::ByteStream::from(body))
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("could not upload to {}/{}: {}", bucket, key, e))?;
    Ok(())
}

/// Download the object at `bucket`/`key` into memory.
pub async fn get_bytes(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
) -> Result<Vec<u8>, anyhow::Error> {
    tracing::debug!("will download from bucket {:?} and key {:?}", bucket, key);
    let object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("could not download {}/{}: {}", bucket, key, e))?;
    let data = object
        .body
        .collect()
        .await
        .map_err(|e| anyhow::anyhow!("could not read body of {}/{}: {}", bucket, key, e))?;
    Ok(data.into_bytes().to_vec())
}

/// Remove the object at `bucket`/`key`.
pub async fn delete_key(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
) -> Result<(), anyhow::Error> {
    tracing::debug!("will delete from bucket {:?} and key {:?}", bucket, key);
    client
        .delete_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("could not delete {}/{}: {}", bucket, key, e))?;
    Ok(())
}
