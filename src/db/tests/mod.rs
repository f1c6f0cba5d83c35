mod codec;
mod migrations;
