use rocket::Route;

mod voting;

pub fn routes() -> Vec<Route> {
    voting::routes()
}
