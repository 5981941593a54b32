mod database;
mod model;
mod predict;
mod search;

use actix_identity::{CookieIdentityPolicy, Identity, IdentityService};
use actix_web::{error, middleware::Logger, web, App, HttpResponse, HttpServer};
use database::*;
use log::debug;
use model::*;
use predict::{Basis, RatingsSource};
use search::TitleIndexExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

type Tera = web::Data<tera::Tera>;
type Db = web::Data<sled::Db>;
type Config = web::Data<AppConfig>;

struct AppConfig {
    /// Email of the reference profile every taste gets measured against.
    eye_email: String,
}

const BERATEMENT_MESSAGES: [&str; 5] = [
    "I suppose you don't have such bad taste after all.",
    "I regret every decision that I've ever made that has brought me to listen to your opinion.",
    "Words fail me, as your taste in movies has clearly failed you.",
    "Did you watch this movie in an alternate universe where your taste doesn't suck?",
    "Words cannot express the awfulness of your taste.",
];

// Truncate then clamp: estimates built from anti-correlated neighbors can
// differ by more than the score scale, those land on the harshest message.
fn beratement(difference: f64) -> &'static str {
    let index = (difference.trunc() as usize).min(BERATEMENT_MESSAGES.len() - 1);
    BERATEMENT_MESSAGES[index]
}

fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> error::Error {
    debug!("{:?}", err);
    error::ErrorInternalServerError(message)
}

fn redirect(location: &str) -> HttpResponse {
    HttpResponse::Found().header("location", location).finish()
}

fn current_user(id: &Identity, db: &sled::Db) -> actix_web::Result<Option<(u64, User)>> {
    let user_id = match id.identity().and_then(|s| s.parse::<u64>().ok()) {
        Some(user_id) => user_id,
        None => return Ok(None),
    };
    Ok(db
        .get_user(user_id)
        .map_err(|err| log_error(err, "Database error"))?
        .map(|user| (user_id, user)))
}

fn base_context(
    id: &Identity,
    db: &sled::Db,
) -> actix_web::Result<(tera::Context, Option<(u64, User)>)> {
    let mut ctx = tera::Context::new();
    let current = current_user(id, db)?;
    match &current {
        Some((user_id, user)) => {
            ctx.insert("logged_in", &true);
            ctx.insert("current_user_id", user_id);
            ctx.insert("current_email", &user.email);
        }
        None => ctx.insert("logged_in", &false),
    }
    Ok((ctx, current))
}

fn render(tera: &tera::Tera, template: &str, ctx: &tera::Context) -> actix_web::Result<HttpResponse> {
    let body = tera
        .render(template, ctx)
        .map_err(|err| log_error(err, "Template error"))?;
    Ok(HttpResponse::Ok().content_type("text/html").body(body))
}

async fn index(
    id: Identity,
    tera: Tera,
    db: Db,
    query: web::Query<HashMap<String, String>>,
) -> actix_web::Result<HttpResponse> {
    let (mut ctx, _) = base_context(&id, &db)?;
    ctx.insert("registered", &query.contains_key("registered"));
    ctx.insert("logged_out", &query.contains_key("logout"));
    render(&tera, "index.html", &ctx)
}

async fn register_form(
    id: Identity,
    tera: Tera,
    db: Db,
    query: web::Query<HashMap<String, String>>,
) -> actix_web::Result<HttpResponse> {
    let (mut ctx, _) = base_context(&id, &db)?;
    ctx.insert("exists", &query.contains_key("exists"));
    render(&tera, "register.html", &ctx)
}

#[derive(Serialize, Deserialize)]
struct RegisterParams {
    email: String,
    password: String,
    age: u32,
    zipcode: String,
}

async fn register_post(params: web::Form<RegisterParams>, db: Db) -> actix_web::Result<HttpResponse> {
    let password_hash = bcrypt::hash(&params.password, bcrypt::DEFAULT_COST)
        .map_err(|err| log_error(err, "Hashing error"))?;
    let user = User {
        email: params.email.clone(),
        password_hash,
        age: params.age,
        zipcode: params.zipcode.clone(),
    };
    match db
        .add_user(&user)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(_) => Ok(redirect("/?registered")),
        None => Ok(redirect("/register?exists")),
    }
}

async fn login_form(
    id: Identity,
    tera: Tera,
    db: Db,
    query: web::Query<HashMap<String, String>>,
) -> actix_web::Result<HttpResponse> {
    let (mut ctx, _) = base_context(&id, &db)?;
    ctx.insert("wrong_password", &query.contains_key("wrong_password"));
    render(&tera, "login.html", &ctx)
}

#[derive(Serialize, Deserialize)]
struct LoginParams {
    email: String,
    password: String,
}

async fn login_post(
    params: web::Form<LoginParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    if let Some((user_id, user)) = db
        .get_user_by_email(&params.email)
        .map_err(|err| log_error(err, "Database error"))?
    {
        if bcrypt::verify(&params.password, &user.password_hash)
            .map_err(|err| log_error(err, "Verification error"))?
        {
            id.remember(user_id.to_string());
            return Ok(redirect(&format!("/users/{}", user_id)));
        }
    }
    Ok(redirect("/login?wrong_password"))
}

async fn logout(id: Identity) -> actix_web::Result<HttpResponse> {
    id.forget();
    Ok(redirect("/?logout"))
}

#[derive(Serialize)]
struct UserRow {
    id: u64,
    email: String,
    age: u32,
    zipcode: String,
}

async fn user_list(id: Identity, tera: Tera, db: Db) -> actix_web::Result<HttpResponse> {
    let (mut ctx, _) = base_context(&id, &db)?;
    let mut users: Vec<UserRow> = db
        .list_users()
        .map_err(|err| log_error(err, "Database error"))?
        .into_iter()
        .map(|(id, user)| UserRow {
            id,
            email: user.email,
            age: user.age,
            zipcode: user.zipcode,
        })
        .collect();
    users.sort_by(|a, b| a.email.cmp(&b.email));
    ctx.insert("users", &users);
    render(&tera, "user_list.html", &ctx)
}

#[derive(Serialize)]
struct RatedRow {
    movie_id: u64,
    title: String,
    score: u8,
}

async fn show_user(
    path: web::Path<u64>,
    id: Identity,
    tera: Tera,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let user_id = path.into_inner();
    let (mut ctx, _) = base_context(&id, &db)?;
    let user = db
        .get_user(user_id)
        .map_err(|err| log_error(err, "Database error"))?
        .ok_or_else(|| error::ErrorNotFound("No such user"))?;
    let mut rated = Vec::new();
    for (movie_id, rating) in db
        .ratings_by_user(user_id)
        .map_err(|err| log_error(err, "Database error"))?
    {
        let movie = db
            .get_movie(movie_id)
            .map_err(|err| log_error(err, "Database error"))?
            .ok_or_else(|| log_error(format!("Missing movie {}", movie_id), "Database error"))?;
        rated.push(RatedRow {
            movie_id,
            title: movie.title,
            score: rating.score,
        });
    }
    rated.sort_by(|a, b| a.title.cmp(&b.title));
    ctx.insert("user", &UserRow {
        id: user_id,
        email: user.email,
        age: user.age,
        zipcode: user.zipcode,
    });
    ctx.insert("ratings", &rated);
    render(&tera, "user_info.html", &ctx)
}

#[derive(Serialize)]
struct MovieRow {
    id: u64,
    title: String,
}

async fn movie_list(
    id: Identity,
    tera: Tera,
    db: Db,
    query: web::Query<HashMap<String, String>>,
) -> actix_web::Result<HttpResponse> {
    let (mut ctx, _) = base_context(&id, &db)?;
    let movies = match query.get("q").filter(|q| !q.trim().is_empty()) {
        Some(q) => {
            ctx.insert("query", q);
            let index = db
                .open_title_index()
                .map_err(|err| log_error(err, "Database error"))?;
            let mut rows = Vec::new();
            for (movie_id, _matched) in index
                .query(q)
                .map_err(|err| log_error(err, "Database error"))?
            {
                if let Some(movie) = db
                    .get_movie(movie_id)
                    .map_err(|err| log_error(err, "Database error"))?
                {
                    rows.push(MovieRow {
                        id: movie_id,
                        title: movie.title,
                    });
                }
            }
            rows
        }
        None => {
            ctx.insert("query", "");
            let mut rows: Vec<MovieRow> = db
                .list_movies()
                .map_err(|err| log_error(err, "Database error"))?
                .into_iter()
                .map(|(id, movie)| MovieRow {
                    id,
                    title: movie.title,
                })
                .collect();
            rows.sort_by(|a, b| a.title.cmp(&b.title));
            rows
        }
    };
    ctx.insert("movies", &movies);
    render(&tera, "movie_list.html", &ctx)
}

async fn show_movie(
    path: web::Path<u64>,
    id: Identity,
    tera: Tera,
    db: Db,
    config: Config,
    query: web::Query<HashMap<String, String>>,
) -> actix_web::Result<HttpResponse> {
    let movie_id = path.into_inner();
    let (mut ctx, current) = base_context(&id, &db)?;
    ctx.insert("rated", &query.contains_key("rated"));
    ctx.insert("invalid_score", &query.contains_key("invalid_score"));
    let movie = db
        .get_movie(movie_id)
        .map_err(|err| log_error(err, "Database error"))?
        .ok_or_else(|| error::ErrorNotFound("No such movie"))?;
    ctx.insert("movie", &movie);
    ctx.insert("movie_id", &movie_id);

    let average = predict::movie_average(db.get_ref(), movie_id)
        .map_err(|err| log_error(err, "Prediction error"))?;
    ctx.insert("average", &average.map(|a| format!("{:.1}", a)));

    let mut user_rating = None;
    let mut prediction = None;
    let mut eye_rating = None;
    let mut difference = None;
    if let Some((user_id, _)) = current {
        user_rating = db
            .get_ref()
            .score(user_id, movie_id)
            .map_err(|err| log_error(err, "Prediction error"))?;
        if user_rating.is_none() {
            prediction = predict::predict_with_fallback(db.get_ref(), user_id, movie_id)
                .map_err(|err| log_error(err, "Prediction error"))?;
        }
        // Whatever score the viewer effectively holds gets measured
        // against the reference profile.
        let effective = user_rating
            .map(f64::from)
            .or_else(|| prediction.map(|p| p.score));
        let (eye_id, _) = db
            .get_user_by_email(&config.eye_email)
            .map_err(|err| log_error(err, "Database error"))?
            .ok_or_else(|| {
                log_error(
                    format!("Reference profile missing: {}", config.eye_email),
                    "Configuration error",
                )
            })?;
        if eye_id != user_id {
            eye_rating = match db
                .get_ref()
                .score(eye_id, movie_id)
                .map_err(|err| log_error(err, "Prediction error"))?
            {
                Some(score) => Some(f64::from(score)),
                None => predict::predict(db.get_ref(), eye_id, movie_id)
                    .map_err(|err| log_error(err, "Prediction error"))?,
            };
            if let (Some(eye), Some(own)) = (eye_rating, effective) {
                difference = Some((eye - own).abs());
            }
        }
    }
    ctx.insert("user_rating", &user_rating);
    ctx.insert("prediction", &prediction.map(|p| format!("{:.1}", p.score)));
    ctx.insert(
        "prediction_is_fallback",
        &prediction.map_or(false, |p| p.basis == Basis::MovieAverage),
    );
    ctx.insert("eye_rating", &eye_rating.map(|e| format!("{:.1}", e)));
    ctx.insert("beratement", &difference.map(beratement));
    render(&tera, "movie_details.html", &ctx)
}

#[derive(Serialize, Deserialize)]
struct RateParams {
    score: u8,
}

async fn rate_movie(
    path: web::Path<u64>,
    params: web::Form<RateParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let movie_id = path.into_inner();
    let (user_id, _) = match current_user(&id, &db)? {
        Some(current) => current,
        None => return Ok(redirect("/login")),
    };
    if db
        .get_movie(movie_id)
        .map_err(|err| log_error(err, "Database error"))?
        .is_none()
    {
        return Err(error::ErrorNotFound("No such movie"));
    }
    if params.score < SCORE_MIN || params.score > SCORE_MAX {
        return Ok(redirect(&format!("/movies/{}?invalid_score", movie_id)));
    }
    db.rate(user_id, movie_id, &Rating {
        score: params.score,
    })
    .map_err(|err| log_error(err, "Database error"))?;
    Ok(redirect(&format!("/movies/{}?rated", movie_id)))
}

fn cookie_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    if let Ok(secret) = std::env::var("COOKIE_KEY") {
        for (dst, src) in key.iter_mut().zip(secret.as_bytes()) {
            *dst = *src;
        }
    }
    key
}

fn seed(db: &sled::Db, eye_email: &str) -> sled::Result<()> {
    if !db.list_users()?.is_empty() {
        return Ok(());
    }
    let titles = db.open_title_index()?;
    let mut movie_ids = Vec::new();
    for &(title, year, imdb) in &[
        ("Toy Story", "1995", "http://www.imdb.com/title/tt0114709"),
        ("Twelve Monkeys", "1995", "http://www.imdb.com/title/tt0114746"),
        ("Braveheart", "1995", "http://www.imdb.com/title/tt0112573"),
        ("Apollo 13", "1995", "http://www.imdb.com/title/tt0112384"),
        ("Seven", "1995", "http://www.imdb.com/title/tt0114369"),
    ] {
        let movie_id = db.add_movie(&Movie {
            title: title.to_owned(),
            released_at: Some(year.to_owned()),
            imdb_url: Some(imdb.to_owned()),
        })?;
        titles.insert(movie_id, title)?;
        movie_ids.push(movie_id);
    }
    let add = |email: &str, age: u32, zipcode: &str| -> sled::Result<u64> {
        Ok(db
            .add_user(&User {
                email: email.to_owned(),
                password_hash: bcrypt::hash("password", bcrypt::DEFAULT_COST).unwrap(),
                age,
                zipcode: zipcode.to_owned(),
            })?
            .expect("seed user already exists"))
    };
    let eye = add(eye_email, 99, "00000")?;
    let alice = add("alice@example.com", 34, "94103")?;
    let bob = add("bob@example.com", 27, "10001")?;
    for &(user_id, movie, score) in &[
        (eye, 0, 1u8),
        (eye, 1, 5),
        (eye, 2, 1),
        (eye, 3, 2),
        (eye, 4, 5),
        (alice, 0, 5),
        (alice, 1, 2),
        (alice, 2, 5),
        (alice, 3, 4),
        (bob, 0, 4),
        (bob, 1, 2),
        (bob, 2, 4),
        (bob, 4, 1),
    ] {
        db.rate(user_id, movie_ids[movie], &Rating { score })?;
    }
    log::info!("Seeded demo catalogue and users");
    Ok(())
}

#[actix_rt::main]
async fn main() -> std::io::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "judgeflix=debug,actix_web=info");
    }
    env_logger::init();

    let eye_email =
        std::env::var("EYE_EMAIL").unwrap_or_else(|_| "the-eye@of-judgment.com".to_owned());
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());
    // One store for all workers; ratings written by one must be visible
    // to predictions served by another.
    let db = match std::env::var("DB_PATH") {
        Ok(path) => sled::open(path).expect("Failed to open database"),
        Err(_) => sled::Config::new()
            .temporary(true)
            .open()
            .expect("Failed to open database"),
    };
    seed(&db, &eye_email).expect("Failed to seed database");
    let private_key = cookie_key();

    HttpServer::new(move || {
        let tera = tera::Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/**/*")).unwrap();
        App::new()
            .wrap(Logger::default())
            .wrap(IdentityService::new(
                CookieIdentityPolicy::new(&private_key)
                    .name("auth-cookie")
                    .secure(false),
            ))
            .data(tera)
            .data(db.clone())
            .data(AppConfig {
                eye_email: eye_email.clone(),
            })
            .route("/", web::get().to(index))
            .route("/register", web::get().to(register_form))
            .route("/register", web::post().to(register_post))
            .route("/login", web::get().to(login_form))
            .route("/login", web::post().to(login_post))
            .route("/logout", web::get().to(logout))
            .route("/users", web::get().to(user_list))
            .route("/users/{id}", web::get().to(show_user))
            .route("/movies", web::get().to(movie_list))
            .route("/movies/{id}", web::get().to(show_movie))
            .route("/movies/{id}", web::post().to(rate_movie))
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beratement_truncates_and_clamps() {
        assert_eq!(beratement(0.0), BERATEMENT_MESSAGES[0]);
        assert_eq!(beratement(0.9), BERATEMENT_MESSAGES[0]);
        assert_eq!(beratement(1.0), BERATEMENT_MESSAGES[1]);
        assert_eq!(beratement(3.7), BERATEMENT_MESSAGES[3]);
        assert_eq!(beratement(4.0), BERATEMENT_MESSAGES[4]);
        assert_eq!(beratement(10.0), BERATEMENT_MESSAGES[4]);
    }
}
