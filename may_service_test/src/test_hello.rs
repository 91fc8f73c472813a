#[may_service::service]
pub trait Hello {
    fn echo(&self, data: String) -> String;
    fn add(&self, x: u32, y: u32) -> u32;
}

#[derive(may_service::Server)]
#[service(Hello)]
pub struct HelloService;

impl Hello for HelloService {
    fn echo(&self, data: String) -> String {
        log::info!("echo {data}");
        data
    }

    fn add(&self, x: u32, y: u32) -> u32 {
        x + y
    }
}
