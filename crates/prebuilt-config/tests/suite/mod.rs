mod discovery;
mod full_config;
