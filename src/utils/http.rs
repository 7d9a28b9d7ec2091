use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client")
});

// Adapter weights are hundreds of MB, so only the connect phase is bounded.
static DOWNLOAD_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build download client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}

pub fn get_download_client() -> &'static Client {
    &DOWNLOAD_CLIENT
}
