use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    pub redis_url: String,

    #[envconfig(default = "beacon:positions")]
    pub stream_key: String,

    #[envconfig(default = "ingesters")]
    pub consumer_group: String,

    /// Approximate number of entries the stream retains. Oldest entries
    /// are evicted past this, acknowledged or not.
    #[envconfig(default = "1000000")]
    pub stream_retention: usize,

    /// How long a live-cache entry stays valid without a newer report.
    #[envconfig(default = "300")]
    pub cache_ttl_secs: u64,

    #[envconfig(default = "beacon:pos")]
    pub cache_key_prefix: String,
}
