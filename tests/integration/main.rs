// Integration tests drive the whole connectivity layer against an in-memory broker.


mod consumer_test;
mod publisher_test;
mod reconnect_test;
